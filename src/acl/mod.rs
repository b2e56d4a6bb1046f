mod network;
mod parser;
mod evaluator;

pub use network::{NetworkRange, RangeError};
pub use parser::{RuleDefinition, AclError, RuleEntry, RuleError, RuleSet, compile, load_rules_from_file, parse_acl_document, parse_rules};
pub use evaluator::{Command, ConnectionRequest};
pub use evaluator::authorize_request as authorize;
