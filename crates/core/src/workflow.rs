//! Workflow graph shape check.
//!
//! The relay never interprets node definitions. The only requirement is
//! that the graph is a JSON object keyed by node id, because that is the
//! shape the backend's `/prompt` endpoint accepts.

use crate::error::CoreError;

/// Reject request bodies that cannot possibly be a workflow graph.
pub fn validate_workflow_shape(workflow: &serde_json::Value) -> Result<(), CoreError> {
    if workflow.is_object() {
        Ok(())
    } else {
        Err(CoreError::Validation(
            "Workflow must be a JSON object mapping node ids to node definitions".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_graph_is_accepted() {
        let graph = json!({"3": {"class_type": "KSampler", "inputs": {}}});
        assert!(validate_workflow_shape(&graph).is_ok());
    }

    #[test]
    fn empty_object_is_passed_through() {
        assert!(validate_workflow_shape(&json!({})).is_ok());
    }

    #[test]
    fn array_is_rejected() {
        let err = validate_workflow_shape(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn scalar_is_rejected() {
        assert!(validate_workflow_shape(&json!("prompt")).is_err());
        assert!(validate_workflow_shape(&serde_json::Value::Null).is_err());
    }
}
