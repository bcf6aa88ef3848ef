//! Wiring: build queues, processors and workers from configuration

use crate::article::Stage;
use crate::config::PipelineConfig;
use crate::model::SubprocessModel;
use crate::queue::{SourceQueue, TableQueue, WorkQueue};
use crate::stage::{
    ArticleParser, Categorizer, CommentaryGenerator, DirectorySource, Ingestor, KeywordClassifier,
    LeadCommentator, ModelClassifier, ModelCommentator, Processor, Source,
};
use crate::storage::ArticleStore;
use crate::worker::{Scheduler, StageWorker};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Worker identifier: `<stage>-<n>-<random suffix>`.
///
/// The suffix keeps ids distinct across processes sharing one store.
pub fn worker_id(stage: Stage, n: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", stage, n, &suffix[..8])
}

/// The four stages bound to one store.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ArticleStore>,
    source: Option<Arc<dyn Source>>,
    processors: HashMap<Stage, Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn ArticleStore>) -> Self {
        Self {
            config,
            store,
            source: None,
            processors: HashMap::new(),
        }
    }

    /// Replace the spool directory as the ingest source.
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the configured processing function of `processor.stage()`.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(processor.stage(), processor);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }

    pub fn processor(&self, stage: Stage) -> Arc<dyn Processor> {
        if let Some(processor) = self.processors.get(&stage) {
            return Arc::clone(processor);
        }
        let processors = &self.config.processors;
        match stage {
            Stage::Ingest => Arc::new(Ingestor::new()),
            Stage::Parse => Arc::new(ArticleParser::default()),
            Stage::Categorize => match &processors.categorizer_model {
                Some(command) => Arc::new(Categorizer::new(Arc::new(ModelClassifier::new(
                    Arc::new(SubprocessModel::from_command(command)),
                    processors.categories.clone(),
                )))),
                None => Arc::new(Categorizer::new(Arc::new(KeywordClassifier::news_defaults()))),
            },
            Stage::Comment => {
                let generator = match &processors.commentary_model {
                    Some(command) => CommentaryGenerator::new(Arc::new(ModelCommentator::new(
                        Arc::new(SubprocessModel::from_command(command)),
                    ))),
                    None => CommentaryGenerator::new(Arc::new(LeadCommentator)),
                };
                Arc::new(generator.with_store(Arc::clone(&self.store)))
            }
        }
    }

    pub fn queue(&self, stage: Stage, worker_id: &str) -> Arc<dyn WorkQueue> {
        match stage {
            Stage::Ingest => {
                let source = self.source.clone().unwrap_or_else(|| {
                    Arc::new(DirectorySource::new(&self.config.processors.spool_dir))
                });
                Arc::new(SourceQueue::new(Arc::clone(&self.store), source))
            }
            _ => {
                let settings = self.config.stages.get(stage);
                Arc::new(
                    TableQueue::new(Arc::clone(&self.store), stage, worker_id)
                        .with_lease(settings.lease())
                        .with_max_attempts(settings.max_attempts),
                )
            }
        }
    }

    /// Worker `n` of `stage`, configured from its stage settings.
    pub fn worker(&self, stage: Stage, n: usize) -> StageWorker {
        let settings = self.config.stages.get(stage);
        let id = worker_id(stage, n);
        StageWorker::new(id.clone(), self.queue(stage, &id), self.processor(stage))
            .with_batch_limit(settings.batch_limit)
            .with_concurrency(settings.concurrency)
            .with_process_timeout(settings.process_timeout())
    }

    /// Scheduler over every enabled stage, or just `only`.
    pub fn scheduler(&self, only: Option<Stage>) -> Scheduler {
        let mut scheduler = Scheduler::new();
        for stage in Stage::ALL {
            let settings = self.config.stages.get(stage);
            let selected = match only {
                Some(s) => s == stage,
                None => settings.enabled,
            };
            if !selected {
                continue;
            }
            for n in 0..settings.workers {
                scheduler.add(self.worker(stage, n), settings.interval());
            }
        }
        scheduler
    }
}
