//! Triggers
//!
//! A trigger reacts to an applied transaction by producing more
//! transactions. Sync triggers run inside the call, right after the store
//! accepted the original. Async triggers are queued as deferred tasks; the
//! session runs them after the caller got its result and the first
//! broadcast went out.

use std::sync::Arc;

use tracing::debug;

use super::Middleware;
use crate::error::Result;
use crate::model::{spaces, Hierarchy, Tx};
use crate::pipeline::{DeferredTask, Next, SessionContext};
use crate::storage::TxResult;

type Matcher = dyn Fn(&Hierarchy, &Tx) -> bool + Send + Sync;
type Handler = dyn Fn(&Hierarchy, &Tx) -> Result<Vec<Tx>> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Sync,
    Async,
}

#[derive(Clone)]
pub struct Trigger {
    pub name: String,
    pub mode: TriggerMode,
    matcher: Arc<Matcher>,
    handler: Arc<Handler>,
}

impl Trigger {
    pub fn new<M, H>(name: &str, mode: TriggerMode, matcher: M, handler: H) -> Self
    where
        M: Fn(&Hierarchy, &Tx) -> bool + Send + Sync + 'static,
        H: Fn(&Hierarchy, &Tx) -> Result<Vec<Tx>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            mode,
            matcher: Arc::new(matcher),
            handler: Arc::new(handler),
        }
    }

    /// Trigger firing for every tx whose object class derives from `class`
    pub fn on_class<H>(name: &str, mode: TriggerMode, class: &str, handler: H) -> Self
    where
        H: Fn(&Hierarchy, &Tx) -> Result<Vec<Tx>> + Send + Sync + 'static,
    {
        let class = class.to_string();
        Self::new(
            name,
            mode,
            move |h: &Hierarchy, tx: &Tx| h.is_derived(&tx.object_class, &class),
            handler,
        )
    }

    pub fn matches(&self, hierarchy: &Hierarchy, tx: &Tx) -> bool {
        (self.matcher)(hierarchy, tx)
    }

    pub fn apply(&self, hierarchy: &Hierarchy, tx: &Tx) -> Result<Vec<Tx>> {
        (self.handler)(hierarchy, tx)
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct TriggersMiddleware {
    triggers: Vec<Trigger>,
}

impl TriggersMiddleware {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

impl Middleware for TriggersMiddleware {
    fn name(&self) -> &'static str {
        "triggers"
    }

    fn tx(&self, ctx: &mut SessionContext, tx: &Tx, next: Next<'_>) -> Result<TxResult> {
        let result = next.tx(ctx, tx)?;
        if !result.is_applied() || self.triggers.is_empty() {
            return Ok(result);
        }

        // Trigger output does not re-trigger
        let leaves: Vec<&Tx> = tx
            .leaves()
            .into_iter()
            .filter(|leaf| leaf.space != spaces::DERIVED_TX)
            .collect();

        for trigger in &self.triggers {
            for leaf in &leaves {
                let fired = {
                    let hierarchy = next.context().hierarchy.read();
                    trigger.matches(&hierarchy, leaf)
                };
                if !fired {
                    continue;
                }

                match trigger.mode {
                    TriggerMode::Sync => {
                        let produced = {
                            let hierarchy = next.context().hierarchy.read();
                            trigger.apply(&hierarchy, leaf)?
                        };
                        debug!(trigger = %trigger.name, count = produced.len(), "sync trigger");
                        for derived in &produced {
                            next.tx(ctx, derived)?;
                        }
                    }
                    TriggerMode::Async => {
                        let trigger = trigger.clone();
                        let source = (*leaf).clone();
                        ctx.deferred.push(DeferredTask::new(trigger.name.clone(), move |ctx, pipeline| {
                            let produced = {
                                let hierarchy = pipeline.context().hierarchy.read();
                                trigger.apply(&hierarchy, &source)?
                            };
                            debug!(trigger = %trigger.name, count = produced.len(), "async trigger");
                            for derived in &produced {
                                pipeline.apply(ctx, derived)?;
                            }
                            Ok(())
                        }));
                    }
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod triggers_tests {
    use super::*;
    use crate::model::{classes, core::class_def, core_model, FindOptions, TxFactory, SYSTEM_ACCOUNT};
    use crate::pipeline::{Pipeline, PipelineContext};
    use crate::storage::{AdapterRegistry, MemoryAdapter};
    use serde_json::{json, Map};

    const TASK: &str = "task:class:Task";
    const ACTIVITY: &str = "activity:class:Message";

    fn activity_trigger(mode: TriggerMode) -> Trigger {
        Trigger::on_class("activity", mode, TASK, |_h, tx| {
            let attrs = json!({ "about": tx.object_id }).as_object().unwrap().clone();
            let id = format!("act-{}", tx.object_id);
            Ok(vec![TxFactory::derived(SYSTEM_ACCOUNT).create_doc(ACTIVITY, "space-1", &id, attrs)])
        })
    }

    fn pipeline(mode: TriggerMode) -> Pipeline {
        let mut txes = core_model();
        txes.push(class_def(TASK, Some(classes::DOC), Some("task")));
        txes.push(class_def(ACTIVITY, Some(classes::DOC), Some("activity")));
        let context = Arc::new(PipelineContext::new(
            "ws",
            txes,
            AdapterRegistry::new(Arc::new(MemoryAdapter::new())),
        ));
        Pipeline::new(context, vec![Box::new(TriggersMiddleware::new(vec![activity_trigger(mode)]))])
    }

    fn activity_count(p: &Pipeline) -> usize {
        p.find_all(&mut SessionContext::system("ws"), ACTIVITY, &Map::new(), &FindOptions::default())
            .unwrap()
            .len()
    }

    #[test]
    fn test_sync_trigger_output_is_derived() {
        let p = pipeline(TriggerMode::Sync);
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("alice").create_doc(TASK, "space-1", "t1", Map::new());

        let outcome = p.submit(&mut ctx, &tx).unwrap();
        assert_eq!(outcome.derived.len(), 2);
        assert_eq!(outcome.derived[1].object_id, "act-t1");
        assert!(outcome.deferred.is_empty());
        assert_eq!(activity_count(&p), 1);
    }

    #[test]
    fn test_async_trigger_is_deferred() {
        let p = pipeline(TriggerMode::Async);
        let mut ctx = SessionContext::system("ws");
        let tx = TxFactory::new("alice").create_doc(TASK, "space-1", "t1", Map::new());

        let outcome = p.submit(&mut ctx, &tx).unwrap();
        assert_eq!(outcome.derived.len(), 1);
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(activity_count(&p), 0);

        let mut follow_up = ctx.follow_up();
        assert_ne!(follow_up.correlation_id, ctx.correlation_id);
        for task in outcome.deferred {
            task.run(&mut follow_up, &p).unwrap();
        }
        assert_eq!(activity_count(&p), 1);
        assert_eq!(follow_up.derived.len(), 1);
    }
}
