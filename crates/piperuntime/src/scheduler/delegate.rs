use super::{RunState, Scheduler, Via};
use crate::graph::StepIndex;
use pipecore::{NodeState, PipelineNode, RunConfig, StepError};

impl Scheduler {
    /// Satisfy a node with `path = W` by running `W`'s matching entry step.
    ///
    /// The nested run's result set is copied back into this node and into
    /// any local successor named `W.<step>`. Those successors become SKIP:
    /// they are never executed here, only fanned out from.
    pub(super) async fn advance_delegate(&self, run: &RunState, index: StepIndex) {
        let def = self.graph.step(index).clone();
        let Some(path) = def.path.as_deref() else {
            return self.advance_local(run, index).await;
        };

        let target = self
            .graph
            .find_by_function(path, &def.function)
            .filter(|&target| self.graph.step(target).entrypoint);
        let Some(target) = target else {
            tracing::debug!(
                "No entrypoint for {} in workflow {}, running [{}.{}] locally",
                def.function,
                path,
                def.workflow,
                def.name
            );
            return self.advance_local(run, index).await;
        };
        let target_name = self.graph.step(target).name.clone();

        let snapshot = {
            let mut nodes = run.nodes.lock().await;
            let node = &mut nodes[index.get()];
            if !node.can_execute() {
                return;
            }
            if !self.try_begin(node) {
                let exhausted = node.clone();
                drop(nodes);
                return self.report_exhausted(run, exhausted);
            }
            node.clone()
        };
        let config = RunConfig {
            args: Some(snapshot.effective_input()),
            scope: run.scope.as_ref().clone(),
            global: run.global.as_ref().clone(),
        };
        tracing::info!("Node {} delegating to {}.{}", snapshot, path, target_name);
        self.publish(run, snapshot);

        let nested = self.run_nested(path, &target_name, config, Some(run.id)).await;

        let (delegate, mirrors) = {
            let mut nodes = run.nodes.lock().await;
            let node = &mut nodes[index.get()];
            match nested.iter().find(|n| n.name() == target_name) {
                Some(entry) if entry.state == NodeState::Done => {
                    node.mirror(entry);
                    let output = node.output.take();
                    node.complete(output);
                }
                Some(entry) => {
                    node.mirror(entry);
                    node.fail_with(entry.error.clone().unwrap_or_default());
                }
                None => node.fail(&StepError::Delegation(format!(
                    "{}.{} did not complete",
                    path, target_name
                ))),
            }
            let delegate = node.clone();
            let mirrors = self.mirror_fan_out(&mut nodes, index, path, &nested);
            (delegate, mirrors)
        };

        match &delegate.error {
            None => tracing::info!("Node {} resumed from nested run", delegate),
            Some(error) => tracing::error!("Node {} failed: {}", delegate, error),
        }
        self.publish(run, delegate);
        for (_, mirror) in &mirrors {
            self.publish(run, mirror.clone());
        }

        self.advance(run, index, Via::Resume).await;
        for (mirror, node) in mirrors {
            if node.state == NodeState::Skip {
                self.advance(run, mirror, Via::Resume).await;
            }
        }
        self.drain_queued(run, index).await;
    }

    /// Copy nested results into local successors named `<path>.<step>`
    fn mirror_fan_out(
        &self,
        nodes: &mut [PipelineNode],
        index: StepIndex,
        path: &str,
        nested: &[PipelineNode],
    ) -> Vec<(StepIndex, PipelineNode)> {
        let prefix = format!("{}.", path);
        let mut mirrored = Vec::new();

        for &successor in self.graph.fan_out(index) {
            let local = &mut nodes[successor.get()];
            if !local.can_execute() {
                continue;
            }
            let Some(source) = local
                .name()
                .strip_prefix(&prefix)
                .and_then(|name| nested.iter().find(|n| n.name() == name))
            else {
                continue;
            };

            local.mirror(source);
            match source.state {
                NodeState::Done => local.state = NodeState::Skip,
                _ => local.fail_with(source.error.clone().unwrap_or_default()),
            }
            mirrored.push((successor, local.clone()));
        }

        mirrored
    }
}
