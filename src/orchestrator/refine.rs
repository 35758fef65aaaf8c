//! The bounded Assess<->Refine loop, isolated from orchestration so the
//! cap-reached behavior is auditable and testable on its own.

use async_trait::async_trait;

use crate::pipeline::AssessVerdict;

/// What to do after an Assess verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineDecision {
    /// Verdict approved; move on to Finalize.
    Accept,
    /// Rejected with refinements remaining; run Refine once more.
    Refine,
    /// Rejected at the cap; finalize with the draft as it stands.
    CapReached,
}

/// Pure decision function over the verdict and the counter.
pub fn decide(approved: bool, refinement_count: u32, max_refinements: u32) -> RefineDecision {
    if approved {
        RefineDecision::Accept
    } else if refinement_count >= max_refinements {
        RefineDecision::CapReached
    } else {
        RefineDecision::Refine
    }
}

/// The Assess/Refine pair the loop drives.
#[async_trait]
pub trait RefineSteps {
    type Error;

    /// Run one Assess pass and return its verdict.
    async fn assess(&mut self, refinement_count: u32) -> Result<AssessVerdict, Self::Error>;

    /// Run one Refine pass against the rejecting verdict's feedback.
    async fn refine(&mut self, feedback: String) -> Result<(), Self::Error>;
}

/// Result of a completed refine loop.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// The last Assess verdict produced.
    pub verdict: AssessVerdict,
    pub refinements_used: u32,
    /// True when the loop stopped on the cap rather than on approval.
    pub cap_reached: bool,
}

/// Drive Assess and Refine until approval or the refinement cap.
///
/// The counter is owned here, so `refinements_used <= max_refinements`
/// holds throughout, and on cap-reached the pipeline proceeds with the
/// most recent Refine output (no further Refine, no extra Assess).
pub async fn run_refine_loop<S>(
    steps: &mut S,
    max_refinements: u32,
) -> Result<RefineOutcome, S::Error>
where
    S: RefineSteps + Send,
{
    let mut refinements_used = 0u32;
    loop {
        let verdict = steps.assess(refinements_used).await?;
        match decide(verdict.approved, refinements_used, max_refinements) {
            RefineDecision::Accept => {
                return Ok(RefineOutcome {
                    verdict,
                    refinements_used,
                    cap_reached: false,
                });
            }
            RefineDecision::CapReached => {
                return Ok(RefineOutcome {
                    verdict,
                    refinements_used,
                    cap_reached: true,
                });
            }
            RefineDecision::Refine => {
                refinements_used += 1;
                steps.refine(verdict.feedback.clone()).await?;
            }
        }
    }
}
