//! Outreach status state machine.
//!
//! Pure decision logic - no IO, only transitions. Callers load the CRM
//! record, apply an event here, and persist the result.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OutreachTransitionError;

/// CRM-visible lifecycle of a property's outreach, in workflow order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutreachStatus {
    #[default]
    NyKraeverResearch,
    ResearchIgangsat,
    ResearchDoneContactPending,
    KlarTilUdsendelse,
    FoersteMailSendt,
    OpfoelgningSendt,
    SvarModtaget,
    LukketVundet,
    LukketTabt,
    Fejl,
}

/// Something that happened to a property's outreach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachEvent {
    ResearchStarted,
    ResearchCompleted,
    /// Manual promotion by an operator
    MarkedReady,
    FirstMailSent,
    FollowUpSent,
    ReplyReceived,
    ClosedWon,
    ClosedLost,
    /// Unrecoverable processing error
    Failed,
    /// Operator re-enters the flow after an error
    Reset,
}

impl OutreachStatus {
    pub const ALL: [OutreachStatus; 10] = [
        OutreachStatus::NyKraeverResearch,
        OutreachStatus::ResearchIgangsat,
        OutreachStatus::ResearchDoneContactPending,
        OutreachStatus::KlarTilUdsendelse,
        OutreachStatus::FoersteMailSendt,
        OutreachStatus::OpfoelgningSendt,
        OutreachStatus::SvarModtaget,
        OutreachStatus::LukketVundet,
        OutreachStatus::LukketTabt,
        OutreachStatus::Fejl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutreachStatus::NyKraeverResearch => "NY_KRAEVER_RESEARCH",
            OutreachStatus::ResearchIgangsat => "RESEARCH_IGANGSAT",
            OutreachStatus::ResearchDoneContactPending => "RESEARCH_DONE_CONTACT_PENDING",
            OutreachStatus::KlarTilUdsendelse => "KLAR_TIL_UDSENDELSE",
            OutreachStatus::FoersteMailSendt => "FOERSTE_MAIL_SENDT",
            OutreachStatus::OpfoelgningSendt => "OPFOELGNING_SENDT",
            OutreachStatus::SvarModtaget => "SVAR_MODTAGET",
            OutreachStatus::LukketVundet => "LUKKET_VUNDET",
            OutreachStatus::LukketTabt => "LUKKET_TABT",
            OutreachStatus::Fejl => "FEJL",
        }
    }

    /// `LUKKET_VUNDET` and `LUKKET_TABT`. `FEJL` is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutreachStatus::LukketVundet | OutreachStatus::LukketTabt)
    }

    /// States before `KLAR_TIL_UDSENDELSE` that an operator may promote.
    pub fn is_pre_ready(&self) -> bool {
        matches!(
            self,
            OutreachStatus::NyKraeverResearch
                | OutreachStatus::ResearchIgangsat
                | OutreachStatus::ResearchDoneContactPending
        )
    }

    pub fn apply(self, event: OutreachEvent) -> Result<OutreachStatus, OutreachTransitionError> {
        use OutreachEvent as E;
        use OutreachStatus as S;

        let next = match (self, event) {
            (s, E::Failed) if !s.is_terminal() => S::Fejl,
            (S::Fejl, E::Reset) => S::NyKraeverResearch,

            (S::NyKraeverResearch | S::ResearchDoneContactPending, E::ResearchStarted) => {
                S::ResearchIgangsat
            }
            (S::ResearchIgangsat, E::ResearchStarted) => S::ResearchIgangsat,
            (S::NyKraeverResearch | S::ResearchIgangsat, E::ResearchCompleted) => {
                S::ResearchDoneContactPending
            }

            (s, E::MarkedReady) if s.is_pre_ready() => S::KlarTilUdsendelse,

            (S::KlarTilUdsendelse, E::FirstMailSent) => S::FoersteMailSendt,
            (S::FoersteMailSendt | S::OpfoelgningSendt, E::FollowUpSent) => S::OpfoelgningSendt,
            (S::FoersteMailSendt | S::OpfoelgningSendt, E::ReplyReceived) => S::SvarModtaget,

            (S::SvarModtaget, E::ClosedWon) => S::LukketVundet,
            (s, E::ClosedLost) if !s.is_terminal() => S::LukketTabt,

            (from, event) => return Err(OutreachTransitionError { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for OutreachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutreachStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutreachStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid outreach status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OutreachEvent as E;
    use OutreachStatus as S;

    #[test]
    fn happy_path_runs_in_workflow_order() {
        let events = [
            E::ResearchStarted,
            E::ResearchCompleted,
            E::MarkedReady,
            E::FirstMailSent,
            E::FollowUpSent,
            E::ReplyReceived,
            E::ClosedWon,
        ];
        let end = events
            .into_iter()
            .try_fold(S::NyKraeverResearch, |s, e| s.apply(e))
            .unwrap();
        assert_eq!(end, S::LukketVundet);
    }

    #[test]
    fn failure_reachable_from_every_non_terminal_state() {
        for status in S::ALL {
            let result = status.apply(E::Failed);
            if status.is_terminal() {
                assert!(result.is_err(), "{status}");
            } else {
                assert_eq!(result.unwrap(), S::Fejl);
            }
        }
    }

    #[test]
    fn fejl_reenters_at_new() {
        assert_eq!(S::Fejl.apply(E::Reset).unwrap(), S::NyKraeverResearch);
        assert!(S::KlarTilUdsendelse.apply(E::Reset).is_err());
    }

    #[test]
    fn mark_ready_only_from_pre_ready_states() {
        for status in [S::NyKraeverResearch, S::ResearchIgangsat, S::ResearchDoneContactPending] {
            assert_eq!(status.apply(E::MarkedReady).unwrap(), S::KlarTilUdsendelse);
        }
        for status in [S::LukketTabt, S::LukketVundet, S::FoersteMailSendt, S::Fejl] {
            let err = status.apply(E::MarkedReady).unwrap_err();
            assert_eq!(err.from, status);
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for event in [E::ResearchStarted, E::FirstMailSent, E::ClosedLost, E::Reset] {
            assert!(S::LukketTabt.apply(event).is_err());
            assert!(S::LukketVundet.apply(event).is_err());
        }
    }

    #[test]
    fn serializes_with_crm_names() {
        let json = serde_json::to_string(&S::ResearchDoneContactPending).unwrap();
        assert_eq!(json, "\"RESEARCH_DONE_CONTACT_PENDING\"");
        assert_eq!("FOERSTE_MAIL_SENDT".parse::<S>().unwrap(), S::FoersteMailSendt);
    }
}
