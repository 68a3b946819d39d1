//! Built-in core model
//!
//! Class definitions every workspace starts with. Transaction ids are derived
//! from the class id so that replaying the core model into an existing
//! workspace is a no-op.

use serde_json::{Map, Value};

use super::tx::{Tx, TxOp};
use super::{classes, domains, spaces, SYSTEM_ACCOUNT};

/// Deterministic model transaction defining one class.
pub fn class_def(id: &str, extends: Option<&str>, domain: Option<&str>) -> Tx {
    define(classes::CLASS, id, extends, domain)
}

pub fn mixin_def(id: &str, extends: &str) -> Tx {
    define(classes::MIXIN, id, Some(extends), None)
}

fn define(kind: &str, id: &str, extends: Option<&str>, domain: Option<&str>) -> Tx {
    let mut attributes = Map::new();
    if let Some(extends) = extends {
        attributes.insert("extends".to_string(), Value::String(extends.to_string()));
    }
    if let Some(domain) = domain {
        attributes.insert("domain".to_string(), Value::String(domain.to_string()));
    }

    Tx {
        id: format!("tx:{}", id),
        space: spaces::TX.to_string(),
        object_id: id.to_string(),
        object_class: kind.to_string(),
        object_space: spaces::MODEL.to_string(),
        modified_on: 0,
        modified_by: SYSTEM_ACCOUNT.to_string(),
        created_by: Some(SYSTEM_ACCOUNT.to_string()),
        attached_to: None,
        attached_to_class: None,
        collection: None,
        op: TxOp::CreateDoc { attributes },
    }
}

/// The core class set
pub fn core_model() -> Vec<Tx> {
    use classes::*;

    vec![
        class_def(OBJ, None, None),
        class_def(DOC, Some(OBJ), None),
        class_def(ATTACHED_DOC, Some(DOC), None),
        class_def(CLASS, Some(DOC), Some(domains::MODEL)),
        class_def(MIXIN, Some(CLASS), None),
        class_def(ATTRIBUTE, Some(DOC), Some(domains::MODEL)),
        class_def(SPACE, Some(DOC), Some(domains::MODEL)),
        class_def(TX, Some(DOC), Some(domains::TX)),
        class_def(TX_CUD, Some(TX), None),
        class_def(TX_CREATE_DOC, Some(TX_CUD), None),
        class_def(TX_UPDATE_DOC, Some(TX_CUD), None),
        class_def(TX_REMOVE_DOC, Some(TX_CUD), None),
        class_def(TX_MIXIN, Some(TX_CUD), None),
        class_def(TX_APPLY_IF, Some(TX), None),
        class_def(TX_WORKSPACE_EVENT, Some(TX), None),
        class_def(PLUGIN_CONFIGURATION, Some(DOC), Some(domains::CONFIGURATION)),
        class_def(MIGRATION_STATE, Some(DOC), Some(domains::MIGRATION)),
        class_def(PREFERENCE, Some(DOC), Some(domains::PREFERENCE)),
        class_def(BENCHMARK_DOC, Some(DOC), Some(domains::BENCHMARK)),
        class_def(TRANSIENT_DOC, Some(DOC), Some(domains::TRANSIENT)),
    ]
}
