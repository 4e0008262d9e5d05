use crate::infra::{InMemoryLoanRepository, PanelMatcher, RuleBasedEligibility};
use chrono::Local;
use clap::Args;
use loan_origination::error::AppError;
use loan_origination::workflows::origination::{
    ApplicantProfile, CurrentUser, DocumentSubmission, EmploymentStatus, InstitutionUpdate,
    LoanStatus, LoanTracker, MemorySessionBackend, WorkflowController, WorkflowSettings,
    REQUIRED_KYC_DOCUMENTS,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Logbook details as the applicant would type them.
    #[arg(long, default_value = "Toyota Fielder 2015, KCD 234K")]
    pub(crate) collateral: String,
    /// Requested loan amount in KES.
    #[arg(long, default_value_t = 80_000)]
    pub(crate) requested_amount: u64,
    /// Monthly income in KES.
    #[arg(long, default_value_t = 45_000)]
    pub(crate) monthly_income: u64,
    /// Lender to select; defaults to the first match.
    #[arg(long)]
    pub(crate) institution: Option<String>,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let applicant = CurrentUser {
        id: "demo-applicant".to_string(),
        email: "applicant@example.co.ke".to_string(),
        email_verified: true,
    };
    let profile = ApplicantProfile {
        collateral_description: args.collateral,
        requested_amount: args.requested_amount,
        monthly_income: args.monthly_income,
        proof_of_income_provided: true,
        national_id: "12345678".to_string(),
        employment_status: EmploymentStatus::Employed,
        location: "Nairobi".to_string(),
        credit_score: None,
    };

    let loans = Arc::new(InMemoryLoanRepository::default());
    let controller = WorkflowController::new(
        MemorySessionBackend::default(),
        Arc::new(RuleBasedEligibility),
        Arc::new(PanelMatcher),
        loans.clone(),
        WorkflowSettings::default(),
    );
    let tracker = LoanTracker::new(loans);

    println!("Logbook loan origination demo");

    let eligibility = controller.submit(Some(&applicant), profile).await?;
    print_step("Eligibility", &eligibility);
    if !eligibility.verdict.is_eligible {
        print_step("Session", &controller.snapshot());
        return Ok(());
    }

    let matches = controller.request_matches(Some(&applicant)).await?;
    print_step("Matched lenders", &matches);
    let Some(first) = matches.candidates.first() else {
        println!("\nNo lenders matched this application.");
        return Ok(());
    };

    let institution = args.institution.unwrap_or_else(|| first.name.clone());
    let selected = controller.select_institution(Some(&applicant), &institution)?;
    print_step("Selection", &selected.summary_view());

    let submitted = controller.submit_documents(
        Some(&applicant),
        DocumentSubmission {
            institution_name: institution,
            document_categories: REQUIRED_KYC_DOCUMENTS
                .iter()
                .map(|category| category.to_string())
                .collect(),
        },
    )?;
    print_step("KYC submission", &submitted.summary_view());

    let today = Local::now().date_naive();
    for status in [LoanStatus::MfiReviewingDocs, LoanStatus::Approved] {
        let (record, transition) = tracker.apply_institution_update(
            &submitted.id,
            InstitutionUpdate {
                status,
                effective_on: None,
                note: None,
            },
            today,
        )?;
        println!(
            "\nLender update: {} ({:?})",
            record.status().label(),
            transition
        );
    }

    print_step("Dashboard", &tracker.dashboard(&applicant.id)?);
    Ok(())
}

fn print_step<T: Serialize>(title: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("\n{title}\n{rendered}"),
        Err(err) => eprintln!("\n{title}: unable to render output ({err})"),
    }
}
