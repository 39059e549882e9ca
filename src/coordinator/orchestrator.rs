use crate::chunk::{MediaFile, UploadStore};
use crate::config::TopicConfig;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::types::{
    DispatchOutcome, DispatchStatus, EngineSelection, StartAnalysisRequest, StartAnalysisResponse,
};
use crate::dispatch::{DispatchMessage, EngineParams, EngineType, MessagePublisher};
use crate::metrics;
use crate::progress::ProgressAggregator;
use crate::storage::ObjectStore;
use crate::task::{Actor, AnalysisTask, TaskEvent, TaskStatus, TaskStore, TaskTree, TaskUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persists analysis tasks and publishes their dispatch messages.
///
/// Tasks are committed before anything is published. A failed publish is
/// reported per engine and leaves that task QUEUED; calling
/// [`TaskOrchestrator::start_analysis`] again creates a fresh run.
#[derive(Clone)]
pub struct TaskOrchestrator {
    uploads: Arc<UploadStore>,
    tasks: Arc<TaskStore>,
    publisher: Arc<dyn MessagePublisher>,
    objects: Arc<dyn ObjectStore>,
    topics: TopicConfig,
    progress: ProgressAggregator,
}

struct Plan {
    engine: EngineType,
    params: EngineParams,
}

impl TaskOrchestrator {
    pub fn new(
        uploads: Arc<UploadStore>,
        tasks: Arc<TaskStore>,
        publisher: Arc<dyn MessagePublisher>,
        objects: Arc<dyn ObjectStore>,
        topics: TopicConfig,
        progress: ProgressAggregator,
    ) -> Self {
        Self {
            uploads,
            tasks,
            publisher,
            objects,
            topics,
            progress,
        }
    }

    pub async fn start_analysis(
        &self,
        request: StartAnalysisRequest,
    ) -> CoordinatorResult<StartAnalysisResponse> {
        if request.engines.is_empty() {
            return Err(CoordinatorError::Validation(
                "at least one engine must be selected".into(),
            ));
        }

        let file = self.ready_file(&request.file_id).await?;
        let plans = plan_engines(&request.engines)?;

        let (eligible, skipped): (Vec<Plan>, Vec<Plan>) = plans
            .into_iter()
            .partition(|plan| plan.engine.supports(file.media_type));

        let engines: Vec<EngineType> = eligible.iter().map(|p| p.engine).collect();
        let tree = self
            .tasks
            .create_analysis(&file.file_id, request.case_ref.as_deref(), &engines)
            .await?;
        let aggregate_id = tree.aggregate.id;

        info!(
            task_id = aggregate_id,
            file_id = %file.file_id,
            media_type = %file.media_type,
            eligible = eligible.len(),
            skipped = skipped.len(),
            "Analysis started"
        );

        if eligible.is_empty() {
            self.tasks
                .apply(
                    aggregate_id,
                    TaskEvent::Cancel,
                    Actor::Orchestrator,
                    TaskUpdate::with_error("no eligible engines for media type", None),
                )
                .await?;
        }

        let mut outcomes = HashMap::with_capacity(request.engines.len());
        for plan in skipped {
            debug!(engine = %plan.engine, file_id = %file.file_id, "Engine skipped for media type");
            metrics::record_task_skipped(plan.engine.as_str());
            outcomes.insert(
                plan.engine,
                DispatchOutcome {
                    engine_type: plan.engine,
                    task_id: None,
                    topic: None,
                    status: DispatchStatus::Skipped {
                        reason: format!(
                            "{} does not apply to {} files",
                            plan.engine, file.media_type
                        ),
                    },
                },
            );
        }

        let media_location = self.media_location(&file);
        for plan in eligible {
            let outcome = self.dispatch(&tree, &file, &media_location, plan).await;
            outcomes.insert(outcome.engine_type, outcome);
        }

        // Report in the order the engines were selected
        let mut dispatched = Vec::with_capacity(outcomes.len());
        for selection in &request.engines {
            if let Some(outcome) = outcomes.remove(&selection.engine) {
                dispatched.push(outcome);
            }
        }

        Ok(StartAnalysisResponse {
            aggregate_task_id: aggregate_id,
            file_id: file.file_id,
            media_type: file.media_type,
            dispatched,
        })
    }

    /// Cancel a task. Cancelling an aggregate cascades to its non-terminal
    /// children; cancelling a child re-evaluates its aggregate.
    ///
    /// Running engines are not interrupted; their late results are ignored.
    pub async fn cancel_task(&self, task_id: i64) -> CoordinatorResult<TaskTree> {
        let task = self.tasks.require(task_id).await?;
        self.tasks
            .apply(task_id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
            .await?;
        self.finish_progress(task_id).await;

        if task.is_aggregate() {
            for child in self.tasks.children(task_id).await? {
                if child.status.is_terminal() {
                    continue;
                }
                match self
                    .tasks
                    .apply(child.id, TaskEvent::Cancel, Actor::User, TaskUpdate::default())
                    .await
                {
                    Ok(_) => self.finish_progress(child.id).await,
                    // Finished while we were cascading
                    Err(e) => debug!(task_id = child.id, error = %e, "Child not cancelled"),
                }
            }
        } else if let Some(parent_id) = task.parent_task_id {
            self.tasks.roll_up(parent_id).await?;
        }

        info!(task_id, "Task cancelled");
        Ok(self.tasks.tree(task_id).await?)
    }

    pub async fn get_task(&self, task_id: i64) -> CoordinatorResult<AnalysisTask> {
        Ok(self.tasks.require(task_id).await?)
    }

    pub async fn get_task_tree(&self, task_id: i64) -> CoordinatorResult<TaskTree> {
        Ok(self.tasks.tree(task_id).await?)
    }

    pub async fn get_progress(&self, task_id: i64) -> CoordinatorResult<HashMap<String, String>> {
        Ok(self.progress.get_progress(task_id).await?)
    }

    async fn ready_file(&self, file_id: &str) -> CoordinatorResult<MediaFile> {
        let file = self
            .uploads
            .get_file(file_id)
            .await?
            .ok_or_else(|| CoordinatorError::FileNotFound(file_id.to_string()))?;

        if !file.is_materialized() {
            return Err(CoordinatorError::NotReady {
                file_id: file_id.to_string(),
                status: file.upload_status,
            });
        }
        Ok(file)
    }

    fn media_location(&self, file: &MediaFile) -> String {
        match &file.storage_key {
            Some(key) => self.objects.url_for(key),
            None => String::new(),
        }
    }

    async fn dispatch(
        &self,
        tree: &TaskTree,
        file: &MediaFile,
        media_location: &str,
        plan: Plan,
    ) -> DispatchOutcome {
        let engine = plan.engine;
        let topic = engine.topic(&self.topics).to_string();
        let task_id = tree.child(engine).map(|t| t.id);

        let status = match task_id {
            Some(task_id) => {
                match self
                    .publish(task_id, file, media_location, &topic, &plan.params)
                    .await
                {
                    Ok(status) => {
                        metrics::record_task_dispatched(engine.as_str());
                        status
                    }
                    Err(e) => {
                        warn!(
                            task_id,
                            engine = %engine,
                            topic = %topic,
                            error = %e,
                            "Dispatch failed, task left QUEUED"
                        );
                        metrics::record_task_dispatch_failed(engine.as_str());
                        DispatchStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }
            None => DispatchStatus::Failed {
                error: format!("no task was persisted for {}", engine),
            },
        };

        DispatchOutcome {
            engine_type: engine,
            task_id,
            topic: Some(topic),
            status,
        }
    }

    async fn publish(
        &self,
        task_id: i64,
        file: &MediaFile,
        media_location: &str,
        topic: &str,
        params: &EngineParams,
    ) -> CoordinatorResult<DispatchStatus> {
        let message = DispatchMessage::new(task_id, &file.file_id, media_location, params)?;
        let receipt = self
            .publisher
            .publish(topic, &file.file_id, message.encode()?)
            .await?;

        debug!(
            task_id,
            topic,
            partition = receipt.partition,
            offset = receipt.offset,
            "Dispatch message published"
        );
        Ok(DispatchStatus::Dispatched {
            partition: receipt.partition,
            offset: receipt.offset,
        })
    }

    async fn finish_progress(&self, task_id: i64) {
        if let Err(e) = self.progress.finish(task_id, TaskStatus::Cancelled, None).await {
            warn!(task_id, error = %e, "Failed to stamp cancelled progress");
        }
    }
}

/// Decode parameters and collapse repeated selections of one engine.
fn plan_engines(selections: &[EngineSelection]) -> CoordinatorResult<Vec<Plan>> {
    let mut plans: Vec<Plan> = Vec::with_capacity(selections.len());

    for selection in selections {
        let params = EngineParams::parse(selection.engine, selection.params.as_ref())?;
        match plans.iter().find(|p| p.engine == selection.engine) {
            Some(existing) if existing.params != params => {
                return Err(CoordinatorError::Validation(format!(
                    "{} selected twice with different parameters",
                    selection.engine
                )));
            }
            Some(_) => {}
            None => plans.push(Plan {
                engine: selection.engine,
                params,
            }),
        }
    }

    Ok(plans)
}
