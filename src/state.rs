//! Shared application state: the active allow-list and session statistics.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::{acl::{self, ConnectionRequest, RuleSet}, config::Settings, stats::SessionStats};

pub struct State {
    acl_rules: ArcSwap<RuleSet>,
    pub stats: Arc<SessionStats>,
}

impl State {
    pub fn new(acl_rules: RuleSet, stats: Arc<SessionStats>) -> Self {
        Self {
            acl_rules: ArcSwap::from_pointee(acl_rules),
            stats,
        }
    }

    /// The currently installed rules. Holding the snapshot keeps it alive
    /// across later reloads.
    pub fn acl_rules(&self) -> Arc<RuleSet> {
        self.acl_rules.load_full()
    }

    pub fn authorize(&self, request: &ConnectionRequest) -> bool {
        self.acl_rules.load().authorize(request)
    }

    pub fn replace_acl_rules(&self, rules: RuleSet) {
        self.acl_rules.store(Arc::new(rules));
    }

    /// Re-reads the ACL file. On any error the previous rules stay active.
    pub fn reload_acl_rules(&self, settings: &Settings) -> anyhow::Result<usize> {
        let rules = acl::load_rules_from_file(&settings.filter_acl_rules_path)?;
        let count = rules.len();
        self.replace_acl_rules(rules);
        info!("Installed {count} ACL rules");
        Ok(count)
    }
}

pub fn init(settings: &Settings, stats: Arc<SessionStats>) -> anyhow::Result<State> {
    let rules = acl::load_rules_from_file(&settings.filter_acl_rules_path)?;
    Ok(State::new(rules, stats))
}
