//! Perceive: capture the screen, store the artifacts, fingerprint the screenshot.
//!
//! The fingerprint is the first 8 bytes of SHA-256 over the decoded screenshot
//! bytes. It is a coarse identity; two captures with the same bytes are the
//! same screen.

use async_trait::async_trait;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use crate::engine::{AgentContext, Executed, NodeFailure, NodeHandler, TransitionPolicy};
use crate::ports::{AgentPorts, ArtifactKind, PortError};
use shared_types::{AgentState, EventPayload, NodeName, ScreenHash};

pub struct PerceiveNode;

pub struct PerceiveInput {
    run_id: String,
    app_id: String,
    step_ordinal: i64,
    settle_delay_ms: u64,
}

pub struct Perception {
    observation_id: String,
    screenshot_ref_id: String,
    ui_hierarchy_xml_ref_id: String,
    hash: ScreenHash,
}

pub fn perceptual_hash(image_bytes: &[u8]) -> ScreenHash {
    let digest = Sha256::digest(image_bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    ScreenHash(u64::from_be_bytes(prefix))
}

/// Number of `<node` elements in a UI hierarchy dump.
pub fn count_ui_elements(xml: &str) -> u32 {
    let count = xml
        .match_indices("<node")
        .filter(|(idx, tag)| {
            xml[idx + tag.len()..]
                .chars()
                .next()
                .map_or(false, |c| c.is_whitespace() || c == '>' || c == '/')
        })
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[async_trait]
impl NodeHandler for PerceiveNode {
    type Input = PerceiveInput;
    type Output = Perception;

    const NAME: NodeName = NodeName::Perceive;

    fn policy(&self, ctx: &AgentContext) -> TransitionPolicy {
        TransitionPolicy::retry(ctx.retry)
    }

    fn build_input(&self, state: &AgentState, ctx: &AgentContext) -> PerceiveInput {
        PerceiveInput {
            run_id: state.run_id.clone(),
            app_id: ctx.app_id.clone(),
            step_ordinal: state.step_ordinal + 1,
            settle_delay_ms: ctx.perceive_settle_delay_ms,
        }
    }

    async fn execute(
        &self,
        input: PerceiveInput,
        ports: &AgentPorts,
    ) -> Result<Executed<Perception>, NodeFailure> {
        if input.settle_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(input.settle_delay_ms)).await;
        }

        let screenshot = ports.perception.capture_screenshot().await?;
        let image_bytes = base64::engine::general_purpose::STANDARD
            .decode(screenshot.base64_image.trim())
            .map_err(|e| PortError::InvalidCapture(format!("screenshot is not base64: {e}")))?;
        if image_bytes.is_empty() {
            return Err(PortError::InvalidCapture("empty screenshot".to_string()).into());
        }
        let hash = perceptual_hash(&image_bytes);

        let (width_px, height_px) = if screenshot.width_px == 0 || screenshot.height_px == 0 {
            let dims = ports.device_info.get_screen_dimensions().await?;
            (dims.width_px, dims.height_px)
        } else {
            (screenshot.width_px, screenshot.height_px)
        };

        let hierarchy = ports.perception.dump_ui_hierarchy().await?;
        let element_count = count_ui_elements(&hierarchy.xml_content);

        let screenshot_ref_id = ports
            .storage
            .store_artifact(
                &input.run_id,
                ArtifactKind::Screenshot,
                image_bytes,
                HashMap::from([
                    ("format".to_string(), screenshot.format.clone()),
                    ("perceptual_hash64".to_string(), hash.to_hex()),
                ]),
            )
            .await?;
        let ui_hierarchy_xml_ref_id = ports
            .storage
            .store_artifact(
                &input.run_id,
                ArtifactKind::UiHierarchy,
                hierarchy.xml_content.into_bytes(),
                HashMap::from([("element_count".to_string(), element_count.to_string())]),
            )
            .await?;

        let observation_id = ulid::Ulid::new().to_string();
        tracing::debug!(
            run_id = %input.run_id,
            hash = %hash,
            element_count,
            "Screen perceived"
        );

        let events = vec![
            EventPayload::ScreenshotCaptured {
                screenshot_ref_id: screenshot_ref_id.clone(),
                format: screenshot.format,
                width_px,
                height_px,
            },
            EventPayload::UiHierarchyCaptured {
                ui_hierarchy_xml_ref_id: ui_hierarchy_xml_ref_id.clone(),
                element_count,
                capture_timestamp_ms: hierarchy.capture_timestamp_ms,
            },
            EventPayload::ScreenPerceived {
                observation_id: observation_id.clone(),
                app_id: input.app_id,
                step_ordinal: input.step_ordinal,
                perceptual_hash64: hash,
                screenshot_ref_id: screenshot_ref_id.clone(),
                ui_hierarchy_xml_ref_id: ui_hierarchy_xml_ref_id.clone(),
            },
        ];

        Ok(Executed::new(
            Perception {
                observation_id,
                screenshot_ref_id,
                ui_hierarchy_xml_ref_id,
                hash,
            },
            events,
        ))
    }

    fn next_node(&self, _output: &Perception) -> Option<NodeName> {
        Some(NodeName::DetectProgress)
    }

    fn apply_output(&self, mut state: AgentState, output: Perception) -> AgentState {
        state.perception.screenshot_ref_id = Some(output.screenshot_ref_id);
        state.perception.ui_hierarchy_xml_ref_id = Some(output.ui_hierarchy_xml_ref_id);
        state.perception.screen_perceptual_hash64 = Some(output.hash);
        state.graph_persistence_outcome_id = Some(output.observation_id);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bytes_hash_identically() {
        let a = perceptual_hash(b"\x89PNG same pixels");
        let b = perceptual_hash(b"\x89PNG same pixels");
        let c = perceptual_hash(b"\x89PNG other pixels");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 16);
    }

    #[test]
    fn test_hash_matches_digest_prefix() {
        let digest = Sha256::digest(b"abc");
        assert_eq!(
            Some(perceptual_hash(b"abc")),
            ScreenHash::from_digest_prefix(&digest)
        );
    }

    #[test]
    fn test_counts_node_elements_only() {
        let xml = r#"<hierarchy><node text="a"/><node><node /></node><nodes/></hierarchy>"#;
        assert_eq!(count_ui_elements(xml), 3);
        assert_eq!(count_ui_elements(""), 0);
    }
}
