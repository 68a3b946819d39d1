//! In-memory store adapter
//!
//! Reference implementation of `StoreAdapter`: one ordered map per domain
//! behind a single lock. Every applied transaction is also recorded as a
//! document of the `tx` domain.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{StoreAdapter, TxResult};
use crate::error::{Result, SyncError};
use crate::model::doc::LOOKUP;
use crate::model::{
    compare_docs, domains, matches_query, ClassQuery, Doc, DocInfo, Domain, DocumentQuery,
    DomainResult, FindOptions, FindResult, Hierarchy, Ref, SearchOptions, SearchQuery,
    SearchResult, SearchResultDoc, Tx, TxOp,
};

type DomainMap = HashMap<Domain, BTreeMap<Ref, Doc>>;

#[derive(Default)]
pub struct MemoryAdapter {
    data: RwLock<DomainMap>,
    indexed: Mutex<HashSet<Domain>>,
}

#[derive(Deserialize)]
struct FindRequest {
    #[serde(rename = "_class")]
    class: Ref,
    #[serde(default)]
    query: DocumentQuery,
    #[serde(default)]
    options: FindOptions,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains `ensure_indexes` has been called for
    pub fn indexed_domains(&self) -> Vec<Domain> {
        let mut result: Vec<Domain> = self.indexed.lock().iter().cloned().collect();
        result.sort();
        result
    }

    pub fn doc_count(&self, domain: &str) -> usize {
        self.data.read().get(domain).map_or(0, BTreeMap::len)
    }

    fn find_in(
        data: &DomainMap,
        hierarchy: &Hierarchy,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<FindResult<Doc>> {
        let domain = hierarchy.get_domain(class)?;
        let classes: HashSet<Ref> = hierarchy.descendants(class).into_iter().collect();

        let mut docs: Vec<Doc> = data
            .get(&domain)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|d| d.class().map_or(false, |c| classes.contains(c)))
            .filter(|d| matches_query(d, query))
            .cloned()
            .collect();

        if let Some(sort) = &options.sort {
            docs.sort_by(|a, b| compare_docs(a, b, sort));
        }

        let total = if options.total { docs.len() as i64 } else { -1 };
        if let Some(limit) = options.limit {
            docs.truncate(limit);
        }

        let mut result = FindResult::new(docs, total);
        if let Some(lookup) = &options.lookup {
            Self::resolve_lookups(data, hierarchy, &mut result, lookup)?;
        }
        Ok(result)
    }

    /// Join referenced documents into `$lookup` and the result's lookup map.
    fn resolve_lookups(
        data: &DomainMap,
        hierarchy: &Hierarchy,
        result: &mut FindResult<Doc>,
        lookup: &BTreeMap<String, Ref>,
    ) -> Result<()> {
        let mut lookup_map = Map::new();
        for doc in &mut result.value {
            let mut joined = Map::new();
            for (attr, class) in lookup {
                let domain = hierarchy.get_domain(class)?;
                let target = doc
                    .get(attr)
                    .and_then(Value::as_str)
                    .and_then(|id| data.get(&domain).and_then(|m| m.get(id)));
                match target {
                    Some(target) => {
                        if let Some(id) = target.id() {
                            lookup_map.insert(id.to_string(), target.clone().into_value());
                        }
                        joined.insert(attr.clone(), target.clone().into_value());
                    }
                    None => {
                        joined.insert(attr.clone(), Value::Null);
                    }
                }
            }
            doc.set(LOOKUP, Value::Object(joined));
        }
        result.lookup_map = Some(lookup_map);
        Ok(())
    }

    fn conditions_hold(
        data: &DomainMap,
        hierarchy: &Hierarchy,
        matches: &[ClassQuery],
        not_matches: &[ClassQuery],
    ) -> Result<bool> {
        let opts = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        for m in matches {
            if Self::find_in(data, hierarchy, &m.class, &m.query, &opts)?.is_empty() {
                return Ok(false);
            }
        }
        for m in not_matches {
            if !Self::find_in(data, hierarchy, &m.class, &m.query, &opts)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply a single non-composite tx. Validates before mutating.
    fn apply_leaf(data: &mut DomainMap, hierarchy: &Hierarchy, tx: &Tx) -> Result<()> {
        if tx.is_workspace_event() {
            return Ok(());
        }

        let domain = hierarchy.get_domain(&tx.object_class)?;
        let docs = data.entry(domain).or_default();

        match &tx.op {
            TxOp::CreateDoc { .. } => {
                if docs.contains_key(&tx.object_id) {
                    return Err(SyncError::DocumentExists(tx.object_id.clone()));
                }
                docs.insert(tx.object_id.clone(), tx.create_doc()?);
            }
            TxOp::UpdateDoc { operations } => {
                let doc = docs
                    .get_mut(&tx.object_id)
                    .ok_or_else(|| SyncError::DocumentNotFound(tx.object_id.clone()))?;
                doc.apply_update(operations);
                doc.touch(&tx.modified_by, tx.modified_on);
            }
            TxOp::RemoveDoc {} => {
                docs.remove(&tx.object_id)
                    .ok_or_else(|| SyncError::DocumentNotFound(tx.object_id.clone()))?;
            }
            TxOp::Mixin { mixin, attributes } => {
                let doc = docs
                    .get_mut(&tx.object_id)
                    .ok_or_else(|| SyncError::DocumentNotFound(tx.object_id.clone()))?;
                doc.apply_mixin(mixin, attributes);
                doc.touch(&tx.modified_by, tx.modified_on);
            }
            TxOp::ApplyIf { .. } | TxOp::WorkspaceEvent { .. } => {}
        }

        data.entry(domains::TX.to_string())
            .or_default()
            .insert(tx.id.clone(), tx.to_doc()?);
        Ok(())
    }
}

impl StoreAdapter for MemoryAdapter {
    fn find_all(
        &self,
        hierarchy: &Hierarchy,
        class: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<FindResult<Doc>> {
        let data = self.data.read();
        Self::find_in(&data, hierarchy, class, query, options)
    }

    fn search_fulltext(
        &self,
        _hierarchy: &Hierarchy,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let terms: Vec<String> = query
            .query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(SearchResult::default());
        }

        let data = self.data.read();
        let mut hits: Vec<SearchResultDoc> = Vec::new();
        for (domain, docs) in data.iter() {
            if domain == domains::TX || domain == domains::MODEL {
                continue;
            }
            for doc in docs.values() {
                let class = doc.class().unwrap_or_default();
                if let Some(classes) = &query.classes {
                    if !classes.iter().any(|c| c == class) {
                        continue;
                    }
                }
                if let Some(spaces) = &query.spaces {
                    if !spaces.iter().any(|s| Some(s.as_str()) == doc.space()) {
                        continue;
                    }
                }

                let text = searchable_text(doc);
                let score: usize = terms.iter().map(|t| text.matches(t.as_str()).count()).sum();
                if score > 0 {
                    hits.push(SearchResultDoc {
                        id: doc.id().unwrap_or_default().to_string(),
                        class: class.to_string(),
                        score: score as f64,
                        title: doc
                            .get("title")
                            .or_else(|| doc.get("name"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        let total = hits.len();
        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }
        Ok(SearchResult {
            docs: hits,
            total: Some(total),
        })
    }

    /// Supported requests: `{"find": {_class, query, options}}` and
    /// `{"count": {_class, query}}`.
    fn domain_request(&self, hierarchy: &Hierarchy, domain: &str, params: &Value) -> Result<Value> {
        let invalid = |e: serde_json::Error| SyncError::InvalidParams {
            method: "domainRequest".to_string(),
            reason: e.to_string(),
        };

        let in_domain = |req: &FindRequest| -> Result<()> {
            let target = hierarchy.get_domain(&req.class)?;
            if target != domain {
                return Err(SyncError::InvalidParams {
                    method: "domainRequest".to_string(),
                    reason: format!("{} lives in domain {}, not {}", req.class, target, domain),
                });
            }
            Ok(())
        };

        if let Some(find) = params.get("find") {
            let req: FindRequest = serde_json::from_value(find.clone()).map_err(invalid)?;
            in_domain(&req)?;
            let value = self.find_all(hierarchy, &req.class, &req.query, &req.options)?;
            return Ok(serde_json::to_value(DomainResult {
                domain: domain.to_string(),
                value,
            })?);
        }

        if let Some(count) = params.get("count") {
            let req: FindRequest = serde_json::from_value(count.clone()).map_err(invalid)?;
            in_domain(&req)?;
            let opts = FindOptions {
                total: true,
                ..Default::default()
            };
            let found = self.find_all(hierarchy, &req.class, &req.query, &opts)?;
            return Ok(serde_json::to_value(DomainResult {
                domain: domain.to_string(),
                value: found.total,
            })?);
        }

        Err(SyncError::UnsupportedDomainRequest(domain.to_string()))
    }

    fn tx(&self, hierarchy: &Hierarchy, tx: &Tx) -> Result<TxResult> {
        let mut data = self.data.write();

        match &tx.op {
            TxOp::ApplyIf {
                matches,
                not_matches,
                ..
            } => {
                if !Self::conditions_hold(&data, hierarchy, matches, not_matches)? {
                    return Ok(TxResult::conditional(false));
                }
                // Stage on a copy so a failing member leaves the store untouched
                let mut staged = data.clone();
                for leaf in tx.leaves() {
                    Self::apply_leaf(&mut staged, hierarchy, leaf)?;
                }
                *data = staged;
                Ok(TxResult::conditional(true))
            }
            _ => {
                Self::apply_leaf(&mut data, hierarchy, tx)?;
                Ok(TxResult::applied())
            }
        }
    }

    fn raw_doc_infos(&self, domain: &str) -> Result<Vec<DocInfo>> {
        let data = self.data.read();
        Ok(data
            .get(domain)
            .into_iter()
            .flat_map(BTreeMap::iter)
            .map(|(id, doc)| DocInfo {
                id: id.clone(),
                hash: doc.content_hash(),
                size: doc.size(),
            })
            .collect())
    }

    fn load_docs(&self, domain: &str, ids: &[Ref]) -> Result<Vec<Doc>> {
        let data = self.data.read();
        let Some(docs) = data.get(domain) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }

    fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()> {
        let mut data = self.data.write();
        let target = data.entry(domain.to_string()).or_default();
        for doc in docs {
            let id = doc
                .id()
                .ok_or_else(|| SyncError::Store("uploaded document has no _id".to_string()))?
                .to_string();
            target.insert(id, doc);
        }
        Ok(())
    }

    fn clean(&self, domain: &str, ids: &[Ref]) -> Result<()> {
        let mut data = self.data.write();
        if let Some(docs) = data.get_mut(domain) {
            for id in ids {
                docs.remove(id);
            }
        }
        Ok(())
    }

    fn domain_hash(&self, domain: &str) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        for info in self.raw_doc_infos(domain)? {
            hasher.update(info.id.as_bytes());
            hasher.update(info.hash.as_bytes());
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    fn estimate_count(&self, domain: &str) -> Result<usize> {
        Ok(self.doc_count(domain))
    }

    fn ensure_indexes(&self, domain: &str) -> Result<()> {
        self.indexed.lock().insert(domain.to_string());
        Ok(())
    }

    fn domains(&self) -> Vec<Domain> {
        let mut result: Vec<Domain> = self.data.read().keys().cloned().collect();
        result.sort();
        result
    }
}

fn searchable_text(doc: &Doc) -> String {
    fn collect(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                out.push_str(&s.to_lowercase());
                out.push(' ');
            }
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }

    let mut out = String::new();
    for (key, value) in &doc.0 {
        if !key.starts_with('_') {
            collect(value, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use crate::model::{core_model, core::class_def, spaces, TxFactory};
    use serde_json::json;

    const TASK: &str = "task:class:Task";

    fn hierarchy() -> Hierarchy {
        let mut txes = core_model();
        txes.push(class_def(TASK, Some(crate::model::classes::DOC), Some("task")));
        Hierarchy::from_txes(&txes)
    }

    fn attrs(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn create(f: &TxFactory, id: &str, title: &str) -> Tx {
        f.create_doc(TASK, "space-1", id, attrs(json!({ "title": title, "rank": id.len() })))
    }

    #[test]
    fn test_create_find_and_tx_log() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");

        store.tx(&h, &create(&f, "t1", "First")).unwrap();
        store.tx(&h, &create(&f, "t2", "Second")).unwrap();

        let found = store
            .find_all(&h, TASK, &attrs(json!({ "title": "Second" })), &FindOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.value[0].created_by(), Some("alice"));
        assert_eq!(found.total, -1);
        assert_eq!(store.doc_count(domains::TX), 2);
    }

    #[test]
    fn test_update_remove_and_errors() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");
        store.tx(&h, &create(&f, "t1", "First")).unwrap();

        let dup = store.tx(&h, &create(&f, "t1", "Again"));
        assert!(matches!(dup, Err(SyncError::DocumentExists(_))));

        store
            .tx(&h, &f.update_doc(TASK, "space-1", "t1", attrs(json!({ "title": "Renamed" }))))
            .unwrap();
        let doc = &store.load_docs("task", &["t1".to_string()]).unwrap()[0];
        assert_eq!(doc.get("title"), Some(&json!("Renamed")));

        store.tx(&h, &f.remove_doc(TASK, "space-1", "t1")).unwrap();
        let missing = store.tx(&h, &f.remove_doc(TASK, "space-1", "t1"));
        assert!(matches!(missing, Err(SyncError::DocumentNotFound(_))));
        assert_eq!(store.doc_count("task"), 0);
    }

    #[test]
    fn test_apply_if_is_atomic() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");
        store.tx(&h, &create(&f, "t1", "First")).unwrap();
        let before = store.domain_hash("task").unwrap();

        // second member fails: t1 already exists
        let batch = f.apply_if(None, vec![], vec![], vec![create(&f, "t2", "New"), create(&f, "t1", "Dup")]);
        assert!(store.tx(&h, &batch).is_err());
        assert_eq!(store.domain_hash("task").unwrap(), before);

        // condition fails: no doc titled Missing
        let cond = ClassQuery {
            class: TASK.to_string(),
            query: attrs(json!({ "title": "Missing" })),
        };
        let batch = f.apply_if(None, vec![cond], vec![], vec![create(&f, "t3", "Third")]);
        assert_eq!(store.tx(&h, &batch).unwrap(), TxResult::conditional(false));
        assert_eq!(store.doc_count("task"), 1);

        let batch = f.apply_if(None, vec![], vec![], vec![create(&f, "t3", "Third"), create(&f, "t4", "Fourth")]);
        assert!(store.tx(&h, &batch).unwrap().is_applied());
        assert_eq!(store.doc_count("task"), 3);
    }

    #[test]
    fn test_sort_limit_total_and_lookup() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");
        store.tx(&h, &create(&f, "a", "A")).unwrap();
        store.tx(&h, &create(&f, "bbb", "B")).unwrap();
        store
            .tx(&h, &f.create_doc(TASK, "space-1", "cc", attrs(json!({ "title": "C", "rank": 2, "parent": "a" }))))
            .unwrap();

        let mut sort = BTreeMap::new();
        sort.insert("rank".to_string(), -1);
        let mut lookup = BTreeMap::new();
        lookup.insert("parent".to_string(), TASK.to_string());
        let opts = FindOptions {
            limit: Some(2),
            sort: Some(sort),
            lookup: Some(lookup),
            total: true,
        };
        let found = store.find_all(&h, TASK, &Map::new(), &opts).unwrap();
        assert_eq!(found.total, 3);
        let ids: Vec<&str> = found.value.iter().filter_map(Doc::id).collect();
        assert_eq!(ids, vec!["bbb", "cc"]);
        assert_eq!(found.value[1].get("$lookup.parent._id"), Some(&json!("a")));
        assert!(found.lookup_map.unwrap().contains_key("a"));
    }

    #[test]
    fn test_raw_access_and_hash() {
        let store = MemoryAdapter::new();
        let doc = Doc::new("x", "c", spaces::WORKSPACE);
        store.upload("blob", vec![doc.clone()]).unwrap();
        let h1 = store.domain_hash("blob").unwrap();

        let infos = store.raw_doc_infos("blob").unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].hash, doc.content_hash());

        store.clean("blob", &["x".to_string()]).unwrap();
        assert_ne!(store.domain_hash("blob").unwrap(), h1);
        assert_eq!(store.estimate_count("blob").unwrap(), 0);
    }

    #[test]
    fn test_domain_request_find_and_count() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");
        store.tx(&h, &create(&f, "t1", "First")).unwrap();

        let value = store
            .domain_request(&h, "task", &json!({ "find": { "_class": TASK, "query": {} } }))
            .unwrap();
        let result: DomainResult<FindResult<Doc>> = serde_json::from_value(value).unwrap();
        assert_eq!(result.domain, "task");
        assert_eq!(result.value.len(), 1);

        let value = store
            .domain_request(&h, "task", &json!({ "count": { "_class": TASK } }))
            .unwrap();
        assert_eq!(value["value"], 1);

        assert!(matches!(
            store.domain_request(&h, "task", &json!({ "drop": {} })),
            Err(SyncError::UnsupportedDomainRequest(_))
        ));

        // the queried class must live in the addressed domain
        let cross = json!({ "find": { "_class": crate::model::classes::PREFERENCE } });
        assert!(matches!(
            store.domain_request(&h, "task", &cross),
            Err(SyncError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_fulltext_search() {
        let h = hierarchy();
        let store = MemoryAdapter::new();
        let f = TxFactory::new("alice");
        store.tx(&h, &create(&f, "t1", "Login bug on login page")).unwrap();
        store.tx(&h, &create(&f, "t2", "Logout issue")).unwrap();

        let query = SearchQuery {
            query: "login".to_string(),
            ..Default::default()
        };
        let result = store.search_fulltext(&h, &query, &SearchOptions::default()).unwrap();
        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0].id, "t1");
        assert_eq!(result.docs[0].score, 2.0);
    }
}
