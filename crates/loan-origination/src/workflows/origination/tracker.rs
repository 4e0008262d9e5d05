use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;

use super::lifecycle::{
    LifecycleError, LoanId, LoanRecord, LoanStatus, LoanSummaryView, RepaymentStatus,
    TransitionKind,
};
use super::repository::{LoanRepository, RepositoryError};

/// Out-of-band decision reported by a lending institution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstitutionUpdate {
    pub status: LoanStatus,
    #[serde(default)]
    pub effective_on: Option<NaiveDate>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepaymentUpdate {
    pub status: RepaymentStatus,
    #[serde(default)]
    pub effective_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuyOffUpdate {
    pub eligible: bool,
    #[serde(default)]
    pub details: Option<String>,
}

/// Read/update facade over submitted loans for the dashboard and institution callbacks.
pub struct LoanTracker<R> {
    repository: Arc<R>,
}

impl<R> LoanTracker<R>
where
    R: LoanRepository + 'static,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Dashboard cards for one applicant, most recently updated first.
    pub fn dashboard(&self, owner: &str) -> Result<Vec<LoanSummaryView>, LoanTrackerError> {
        let mut records = self.repository.list_for_owner(owner)?;
        records.sort_by(|a, b| {
            b.last_update()
                .cmp(&a.last_update())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records.iter().map(LoanRecord::summary_view).collect())
    }

    /// Fetch a loan, hiding other applicants' records behind `NotFound`.
    pub fn detail(&self, owner: &str, id: &LoanId) -> Result<LoanRecord, LoanTrackerError> {
        let record = self
            .repository
            .fetch(id)?
            .filter(|record| record.owner == owner)
            .ok_or(RepositoryError::NotFound)?;
        Ok(record)
    }

    pub fn apply_institution_update(
        &self,
        id: &LoanId,
        update: InstitutionUpdate,
        today: NaiveDate,
    ) -> Result<(LoanRecord, TransitionKind), LoanTrackerError> {
        let mut record = self.fetch(id)?;
        let on = update.effective_on.unwrap_or(today);

        let kind = record.apply_status(update.status, on)?;
        if let Some(note) = update.note.filter(|note| !note.trim().is_empty()) {
            record.notes = Some(note);
        }

        self.repository.update(record.clone())?;
        Ok((record, kind))
    }

    pub fn record_repayment(
        &self,
        id: &LoanId,
        update: RepaymentUpdate,
        today: NaiveDate,
    ) -> Result<LoanRecord, LoanTrackerError> {
        let mut record = self.fetch(id)?;
        record.set_repayment(update.status, update.effective_on.unwrap_or(today))?;
        self.repository.update(record.clone())?;
        Ok(record)
    }

    pub fn set_buy_off(
        &self,
        id: &LoanId,
        update: BuyOffUpdate,
        today: NaiveDate,
    ) -> Result<LoanRecord, LoanTrackerError> {
        let mut record = self.fetch(id)?;
        record.set_buy_off(update.eligible, update.details, today);
        self.repository.update(record.clone())?;
        Ok(record)
    }

    fn fetch(&self, id: &LoanId) -> Result<LoanRecord, LoanTrackerError> {
        let record = self
            .repository
            .fetch(id)?
            .ok_or(RepositoryError::NotFound)?;
        Ok(record)
    }
}

/// Error raised by the loan tracker.
#[derive(Debug, thiserror::Error)]
pub enum LoanTrackerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
