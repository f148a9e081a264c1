use std::collections::BTreeSet;

/// Capabilities this server build advertises.
#[derive(Debug, Clone)]
pub struct ServerCapability(BTreeSet<String>);

impl ServerCapability {
    pub fn new(with_starttls: bool) -> Self {
        let mut set: BTreeSet<String> = [
            "IMAP4rev1",
            "LITERAL+",
            "IDLE",
            "NAMESPACE",
            "CONDSTORE",
            "ENABLE",
            "QRESYNC",
            "UIDPLUS",
            "MOVE",
            "SPECIAL-USE",
            "UNSELECT",
            "COMPRESS=DEFLATE",
            "ID",
            "AUTH=PLAIN",
            "SASL-IR",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        if with_starttls {
            set.insert("STARTTLS".to_string());
        }
        Self(set)
    }

    /// IMAP4rev1 first, extensions after, deterministic order.
    pub fn to_vec(&self) -> Vec<String> {
        let mut out = vec!["IMAP4rev1".to_string()];
        out.extend(self.0.iter().filter(|c| *c != "IMAP4rev1").cloned());
        out
    }

    pub fn support(&self, cap: &str) -> bool {
        self.0.contains(cap)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    NotSupportedByServer,
    Disabled,
    Enabled,
}

impl ClientStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Extension state negotiated by this client, mutated as commands imply
/// or ENABLE requests them.
pub struct ClientCapability {
    pub condstore: ClientStatus,
    pub qresync: ClientStatus,
}

impl ClientCapability {
    pub fn new(server: &ServerCapability) -> Self {
        let gate = |name: &str| match server.support(name) {
            true => ClientStatus::Disabled,
            false => ClientStatus::NotSupportedByServer,
        };
        Self {
            condstore: gate("CONDSTORE"),
            qresync: gate("QRESYNC"),
        }
    }

    pub fn enable_condstore(&mut self) {
        if matches!(self.condstore, ClientStatus::Disabled) {
            self.condstore = ClientStatus::Enabled;
        }
    }

    /// ENABLE (RFC 5161): returns what actually got switched on.
    pub fn try_enable(&mut self, asked: &[String]) -> Vec<String> {
        let mut enabled = vec![];
        for cap in asked {
            match cap.to_ascii_uppercase().as_str() {
                "CONDSTORE" if matches!(self.condstore, ClientStatus::Disabled) => {
                    self.condstore = ClientStatus::Enabled;
                    enabled.push("CONDSTORE".to_string());
                }
                // QRESYNC implies CONDSTORE
                "QRESYNC" if matches!(self.qresync, ClientStatus::Disabled) => {
                    self.qresync = ClientStatus::Enabled;
                    self.enable_condstore();
                    enabled.push("QRESYNC".to_string());
                }
                _ => (),
            }
        }
        enabled
    }
}
