use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::controller::{WorkflowController, WorkflowSettings};
use super::evaluator::{EligibilityEvaluator, InstitutionMatcher};
use super::repository::LoanRepository;
use super::session::MemorySessionBackend;

pub type SessionController<R> = WorkflowController<MemorySessionBackend, R>;

/// One workflow controller per signed-in applicant, created on first use.
pub struct WorkflowSessions<R> {
    controllers: Mutex<HashMap<String, Arc<SessionController<R>>>>,
    evaluator: Arc<dyn EligibilityEvaluator>,
    matcher: Arc<dyn InstitutionMatcher>,
    loans: Arc<R>,
    settings: WorkflowSettings,
}

impl<R> WorkflowSessions<R>
where
    R: LoanRepository + 'static,
{
    pub fn new(
        evaluator: Arc<dyn EligibilityEvaluator>,
        matcher: Arc<dyn InstitutionMatcher>,
        loans: Arc<R>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            controllers: Mutex::new(HashMap::new()),
            evaluator,
            matcher,
            loans,
            settings,
        }
    }

    pub fn loans(&self) -> Arc<R> {
        Arc::clone(&self.loans)
    }

    pub fn for_user(&self, user_id: &str) -> Arc<SessionController<R>> {
        let mut guard = self.controllers.lock().expect("sessions mutex poisoned");
        let controller = guard.entry(user_id.to_string()).or_insert_with(|| {
            debug!(user_id, "opening workflow session");
            Arc::new(WorkflowController::new(
                MemorySessionBackend::default(),
                Arc::clone(&self.evaluator),
                Arc::clone(&self.matcher),
                Arc::clone(&self.loans),
                self.settings.clone(),
            ))
        });
        Arc::clone(controller)
    }

    /// The applicant's controller, without opening one.
    pub fn existing(&self, user_id: &str) -> Option<Arc<SessionController<R>>> {
        self.controllers
            .lock()
            .expect("sessions mutex poisoned")
            .get(user_id)
            .cloned()
    }

    /// Drop the applicant's controller. The caller decides what to do with
    /// work still running against it.
    pub fn close(&self, user_id: &str) -> Option<Arc<SessionController<R>>> {
        let removed = self
            .controllers
            .lock()
            .expect("sessions mutex poisoned")
            .remove(user_id);
        if removed.is_some() {
            debug!(user_id, "closing workflow session");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().expect("sessions mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
