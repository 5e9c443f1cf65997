mod projection;
mod runtime_loop;
mod support;
