//! Guest log capture.
//!
//! Contracts log through the `log_message` syscall or the standalone
//! `env.log_message` import. Lines are kept on the invocation context and
//! emitted through `tracing` at debug level.

use tracing::debug;

use crate::context::InvocationContext;

/// Host side of guest logging.
pub struct LoggingHost;

impl LoggingHost {
    /// Record a line logged by the invocation behind `ctx`.
    pub fn log(ctx: &InvocationContext, message: &str) {
        ctx.push_log(message.to_string());

        debug!(
            tx_id = ctx.tx().tx_id(),
            contract = %ctx.contract(),
            handle = ctx.handle(),
            guest_log = true,
            "{}",
            message
        );
    }

    /// Record a line from an instance with no bound invocation, e.g. during
    /// setup calls.
    pub fn log_unbound(instance_id: &str, message: &str) {
        debug!(instance_id, guest_log = true, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ledger::MemoryLedger;
    use chain_vm_common::ContractId;

    #[test]
    fn test_logging_stores_in_context() {
        let ctx = InvocationContext::new(
            ContractId::new("counter", "1.0.0"),
            "increase",
            MemoryLedger::new().begin("tx-123"),
            0,
            BTreeMap::new(),
        );

        LoggingHost::log(&ctx, "Hello");
        LoggingHost::log(&ctx, "World");

        assert_eq!(ctx.logs(), vec!["Hello".to_string(), "World".to_string()]);
    }
}
