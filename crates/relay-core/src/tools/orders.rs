//! Order plugins used by the customer-support agents
//!
//! The functions are simulations: status lookups return a canned answer,
//! refunds and returns only log that they happened.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{Plugin, ToolHandler, json_schema, required_str};

pub const ORDER_STATUS_PLUGIN: &str = "OrderStatusPlugin";
pub const ORDER_REFUND_PLUGIN: &str = "OrderRefundPlugin";
pub const ORDER_RETURN_PLUGIN: &str = "OrderReturnPlugin";

fn order_id_schema() -> Value {
    json_schema(
        serde_json::json!({
            "order_id": {
                "type": "string",
                "description": "The order identifier given by the customer"
            }
        }),
        vec!["order_id"],
    )
}

fn order_with_reason_schema() -> Value {
    json_schema(
        serde_json::json!({
            "order_id": {
                "type": "string",
                "description": "The order identifier given by the customer"
            },
            "reason": {
                "type": "string",
                "description": "Why the customer wants this"
            }
        }),
        vec!["order_id", "reason"],
    )
}

/// Look up the shipping status of an order
pub struct CheckOrderStatusTool;

impl CheckOrderStatusTool {
    /// Status line for an order; identical for identical input
    pub fn status(order_id: &str) -> String {
        format!("Order {} is shipped and will arrive in 2-3 days.", order_id)
    }
}

#[async_trait]
impl ToolHandler for CheckOrderStatusTool {
    fn name(&self) -> &str {
        "check_order_status"
    }

    fn description(&self) -> &str {
        "Check the status of an order."
    }

    fn input_schema(&self) -> Value {
        order_id_schema()
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let order_id = required_str(&input, "order_id")?;
        Ok(Self::status(order_id))
    }
}

/// Process a refund for an order
pub struct ProcessRefundTool;

#[async_trait]
impl ToolHandler for ProcessRefundTool {
    fn name(&self) -> &str {
        "process_refund"
    }

    fn description(&self) -> &str {
        "Process a refund for an order."
    }

    fn input_schema(&self) -> Value {
        order_with_reason_schema()
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let order_id = required_str(&input, "order_id")?;
        let reason = required_str(&input, "reason")?;
        info!("Processing refund for order {} due to: {}", order_id, reason);
        Ok(format!(
            "Refund for order {} has been processed successfully.",
            order_id
        ))
    }
}

/// Process a return for an order
pub struct ProcessReturnTool;

#[async_trait]
impl ToolHandler for ProcessReturnTool {
    fn name(&self) -> &str {
        "process_return"
    }

    fn description(&self) -> &str {
        "Process a return for an order."
    }

    fn input_schema(&self) -> Value {
        order_with_reason_schema()
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let order_id = required_str(&input, "order_id")?;
        let reason = required_str(&input, "reason")?;
        info!("Processing return for order {} due to: {}", order_id, reason);
        Ok(format!(
            "Return for order {} has been processed successfully.",
            order_id
        ))
    }
}

pub fn order_status_plugin() -> Plugin {
    Plugin::new(ORDER_STATUS_PLUGIN).with_function(Arc::new(CheckOrderStatusTool))
}

pub fn order_refund_plugin() -> Plugin {
    Plugin::new(ORDER_REFUND_PLUGIN).with_function(Arc::new(ProcessRefundTool))
}

pub fn order_return_plugin() -> Plugin {
    Plugin::new(ORDER_RETURN_PLUGIN).with_function(Arc::new(ProcessReturnTool))
}

/// Look up one of the built-in plugins by name
pub fn plugin_by_name(name: &str) -> Option<Plugin> {
    match name {
        ORDER_STATUS_PLUGIN => Some(order_status_plugin()),
        ORDER_REFUND_PLUGIN => Some(order_refund_plugin()),
        ORDER_RETURN_PLUGIN => Some(order_return_plugin()),
        _ => None,
    }
}

pub fn builtin_plugin_names() -> [&'static str; 3] {
    [ORDER_STATUS_PLUGIN, ORDER_REFUND_PLUGIN, ORDER_RETURN_PLUGIN]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolExecutor, ToolRegistry};

    #[tokio::test]
    async fn test_check_order_status_text() {
        let out = CheckOrderStatusTool
            .execute(serde_json::json!({"order_id": "123"}))
            .await
            .unwrap();
        assert_eq!(out, "Order 123 is shipped and will arrive in 2-3 days.");
    }

    #[tokio::test]
    async fn test_check_order_status_is_idempotent() {
        let input = serde_json::json!({"order_id": "123"});
        let first = CheckOrderStatusTool.execute(input.clone()).await.unwrap();
        let second = CheckOrderStatusTool.execute(input).await.unwrap();
        assert_eq!(first, second);
        assert!(!CheckOrderStatusTool.has_side_effects());
    }

    #[tokio::test]
    async fn test_process_return_requires_reason() {
        let err = ProcessReturnTool
            .execute(serde_json::json!({"order_id": "321"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reason"));
    }

    #[tokio::test]
    async fn test_plugins_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register_plugin(&order_refund_plugin());
        registry.register_plugin(&order_return_plugin());

        let refund = registry
            .execute(
                "OrderRefundPlugin-process_refund",
                serde_json::json!({"order_id": "42", "reason": "late"}),
            )
            .await
            .unwrap();
        assert_eq!(refund, "Refund for order 42 has been processed successfully.");

        let ret = registry
            .execute(
                "OrderReturnPlugin-process_return",
                serde_json::json!({"order_id": "321", "reason": "Broken item"}),
            )
            .await
            .unwrap();
        assert_eq!(ret, "Return for order 321 has been processed successfully.");
    }

    #[test]
    fn test_plugin_by_name() {
        for name in builtin_plugin_names() {
            let plugin = plugin_by_name(name).unwrap();
            assert_eq!(plugin.name(), name);
            assert_eq!(plugin.functions().len(), 1);
        }
        assert!(plugin_by_name("ShippingPlugin").is_none());
    }
}
