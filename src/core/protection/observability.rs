// Observability sink - structured security/audit events.
//
// Every violation, mitigation outcome and capacity trip goes through here so
// an audit trail can be built outside the engine.

use std::collections::BTreeMap;

pub const VIOLATION: &str = "VIOLATION";
pub const MITIGATION_APPLIED: &str = "MITIGATION_APPLIED";
pub const MITIGATION_SUPPRESSED: &str = "MITIGATION_SUPPRESSED";
pub const MITIGATION_FAILED: &str = "MITIGATION_FAILED";
pub const MITIGATION_CANCELLED: &str = "MITIGATION_CANCELLED";
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
pub const CONFIG_UNAVAILABLE: &str = "CONFIG_UNAVAILABLE";
pub const GUILD_DATA_PURGED: &str = "GUILD_DATA_PURGED";

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityEvent {
    pub name: &'static str,
    pub fields: BTreeMap<String, String>,
}

impl SecurityEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    /// Audit events record housekeeping; everything else is a security event.
    pub fn is_audit(&self) -> bool {
        self.name == GUILD_DATA_PURGED
    }
}

pub trait ObservabilitySink: Send + Sync {
    fn emit(&self, event: SecurityEvent);
}

/// Writes events through `tracing`: security events as warnings on the
/// `security` target, audit events as info on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn emit(&self, event: SecurityEvent) {
        let fields = serde_json::to_string(&event.fields).unwrap_or_default();
        if event.is_audit() {
            tracing::info!(target: "audit", event = event.name, %fields);
        } else if event.name == MITIGATION_FAILED || event.name == CONFIG_UNAVAILABLE {
            tracing::error!(target: "security", event = event.name, %fields);
        } else {
            tracing::warn!(target: "security", event = event.name, %fields);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects emitted events for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<SecurityEvent>>,
    }

    impl RecordingSink {
        pub fn count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.name == name)
                .count()
        }
    }

    impl ObservabilitySink for RecordingSink {
        fn emit(&self, event: SecurityEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
