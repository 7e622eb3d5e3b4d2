//! Expansion of builds into step graphs.
//!
//! Walks a build's derivation closure, reusing live steps where another
//! build already needs the same derivation, probing the destination store so
//! already-realized derivations never reach the dispatcher.

use crate::build::Build;
use crate::state::Scheduler;
use crate::step::Step;
use futures::future::BoxFuture;
use futures::FutureExt;
use kiln_store::{StoreResult, StorePath};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Outputs of a derivation found already valid during expansion; recorded
/// as a substitution step row rather than scheduled.
#[derive(Debug, Clone)]
pub struct Substitution {
    pub drv_path: StorePath,
    pub outputs: Vec<(String, StorePath)>,
}

#[derive(Default)]
pub struct ExpandResult {
    /// The build's top-level step; `None` when all outputs were already
    /// valid and nothing needs to run.
    pub toplevel: Option<Arc<Step>>,
    pub new_steps: Vec<Arc<Step>>,
    /// Leaves of the new subgraph, to be marked runnable once the database
    /// side of the load has succeeded.
    pub new_runnable: Vec<Arc<Step>>,
    pub substitutions: Vec<Substitution>,
}

struct ExpandCtx<'a> {
    scheduler: &'a Scheduler,
    /// Derivations known to need no build, shared across one monitor pass.
    finished_drvs: &'a mut BTreeSet<StorePath>,
    result: ExpandResult,
}

/// Expand `build` into the step graph. On success the build's toplevel is
/// wired and priorities are propagated; the caller owns making the new
/// leaves runnable.
pub async fn expand_build(
    scheduler: &Arc<Scheduler>,
    build: &Arc<Build>,
    finished_drvs: &mut BTreeSet<StorePath>,
) -> StoreResult<ExpandResult> {
    let mut ctx = ExpandCtx {
        scheduler,
        finished_drvs,
        result: ExpandResult::default(),
    };
    let toplevel = create_step(
        &mut ctx,
        build.drv_path.clone(),
        Some(build.clone()),
        None,
    )
    .await?;
    let mut result = ctx.result;

    if let Some(step) = &toplevel {
        build.set_toplevel(step.clone());
        scheduler.builds.lock().insert(build.id, build.clone());
        build.propagate_priorities();
    }
    result.toplevel = toplevel;
    Ok(result)
}

fn create_step<'a>(
    ctx: &'a mut ExpandCtx<'_>,
    drv_path: StorePath,
    referring_build: Option<Arc<Build>>,
    referring_step: Option<Arc<Step>>,
) -> BoxFuture<'a, StoreResult<Option<Arc<Step>>>> {
    async move {
        if ctx.finished_drvs.contains(&drv_path) {
            return Ok(None);
        }

        // Reuse a live step for this derivation if one exists; the
        // in-flight result is shared between all builds that need it.
        let existing = ctx
            .scheduler
            .steps
            .lock()
            .get(&drv_path)
            .and_then(Weak::upgrade);
        if let Some(step) = existing {
            if step.finished() {
                // Completed under us; its outputs are (about to be) valid.
                ctx.finished_drvs.insert(drv_path);
                return Ok(None);
            }
            attach(&step, referring_build.as_ref(), referring_step.as_ref());
            if step.finished() {
                // Lost the race after attaching; undo and treat as done.
                if let Some(parent) = &referring_step {
                    parent.state.lock().deps.remove(&drv_path);
                }
                ctx.finished_drvs.insert(drv_path);
                return Ok(None);
            }
            return Ok(Some(step));
        }

        let drv = ctx.scheduler.local_store.read_derivation(&drv_path).await?;
        let step = Arc::new(Step::new(
            drv_path.clone(),
            drv,
            &ctx.scheduler.config.this_system,
        ));

        // Probe the destination store; derivations whose outputs are all
        // valid are never scheduled.
        let outputs = step.drv.output_paths();
        let valid = ctx.scheduler.dest_store.query_valid_paths(&outputs).await?;
        if !outputs.is_empty() && valid.len() == outputs.len() {
            ctx.finished_drvs.insert(drv_path.clone());
            if referring_step.is_some() {
                ctx.result.substitutions.push(Substitution {
                    drv_path,
                    outputs: step
                        .drv
                        .outputs
                        .iter()
                        .map(|(name, path)| (name.clone(), path.clone()))
                        .collect(),
                });
            }
            return Ok(None);
        }

        debug!(drv = %drv_path, system = %step.system_type, "created step");
        ctx.scheduler
            .steps
            .lock()
            .insert(drv_path.clone(), Arc::downgrade(&step));
        attach(&step, referring_build.as_ref(), referring_step.as_ref());

        let input_drvs: Vec<StorePath> = step.drv.input_drvs.keys().cloned().collect();
        for input_drv in input_drvs {
            if let Some(dep) = create_step(ctx, input_drv, None, Some(step.clone())).await? {
                step.state.lock().deps.insert(dep.drv_path.clone(), dep);
            }
        }

        let runnable = {
            let mut state = step.state.lock();
            state.created = true;
            state.deps.is_empty()
        };
        ctx.result.new_steps.push(step.clone());
        if runnable {
            ctx.result.new_runnable.push(step.clone());
        }
        Ok(Some(step))
    }
    .boxed()
}

fn attach(step: &Arc<Step>, referring_build: Option<&Arc<Build>>, referring_step: Option<&Arc<Step>>) {
    let mut state = step.state.lock();
    if let Some(build) = referring_build {
        state.builds.push(Arc::downgrade(build));
    }
    if let Some(parent) = referring_step {
        state.rdeps.push(Arc::downgrade(parent));
    }
}
