//! Background worker that hands decided proposals to the application.
//!
//! Jobs run one at a time in emission order on tokio's blocking pool, so a
//! slow application never stalls the consensus loop. Checkpoint completions
//! are fed back to the runner as internal events; failures go to the
//! collaborator error channel and are never retried.

use crate::metrics;
use crate::runner::CollaboratorError;
use pbft_core::{Application, ApplyError, Event};
use pbft_types::{Hash, Proposal, View};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Work delegated to the application.
#[derive(Debug)]
pub(crate) enum ApplyJob {
    Commit { view: View, proposal: Proposal },
    Checkpoint { view: View, digest: Hash },
}

impl ApplyJob {
    fn run(self, application: &dyn Application) -> Result<Option<Event>, ApplyError> {
        match self {
            ApplyJob::Commit { view, proposal } => {
                application.commit(view, &proposal)?;
                Ok(None)
            }
            ApplyJob::Checkpoint { view, digest } => {
                application.build_checkpoint(view, digest)?;
                metrics::record_checkpoint_built();
                Ok(Some(Event::CheckpointBuilt { view, digest }))
            }
        }
    }
}

/// Drain `jobs` until every sender is dropped.
pub(crate) async fn run_apply_worker(
    application: Arc<dyn Application>,
    mut jobs: mpsc::UnboundedReceiver<ApplyJob>,
    callback_tx: mpsc::UnboundedSender<Event>,
    error_tx: mpsc::UnboundedSender<CollaboratorError>,
) {
    while let Some(job) = jobs.recv().await {
        debug!(?job, "Applying");
        let application = application.clone();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || job.run(&*application)).await;
        metrics::record_apply(start.elapsed().as_secs_f64());

        let failure = match result {
            Ok(Ok(Some(event))) => {
                if callback_tx.send(event).is_err() {
                    debug!("Runner gone, stopping apply worker");
                    return;
                }
                continue;
            }
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => CollaboratorError::Apply(e),
            Err(e) => CollaboratorError::Worker(e.to_string()),
        };

        warn!(error = %failure, "Application failed");
        metrics::record_collaborator_error(failure.kind());
        // Nobody listening is fine: the failure is logged and counted.
        let _ = error_tx.send(failure);
    }
}
