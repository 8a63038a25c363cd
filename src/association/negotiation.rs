//! Presentation context negotiation.
//!
//! The acceptor side answers each proposed presentation context
//! with either an accepted transfer syntax or a rejection reason,
//! based on a declarative [`AcceptorPolicy`].
//! Negotiation is a pure function over the proposed contexts,
//! leaving transport concerns to the association types.
use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderAsceReason,
    AssociationRJSource, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason,
};
use crate::registry::UidRegistry;

/// A transfer syntax offered to contexts rejected at negotiation time.
/// Rejected contexts still carry a syntactically valid transfer syntax field,
/// and Implicit VR Little Endian is the one every implementation knows.
const REJECTION_PLACEHOLDER_TS: &str = "1.2.840.10008.1.2";

/// The acceptor's declarative view of what it is willing to negotiate.
#[derive(Debug, Clone)]
pub struct AcceptorPolicy {
    /// the UID registry consulted for transfer syntax support
    pub registry: Arc<UidRegistry>,
    /// the abstract syntaxes this node provides services for
    pub abstract_syntaxes: Vec<String>,
    /// the transfer syntaxes this node is willing to converse in;
    /// when empty, any registry-supported transfer syntax is acceptable
    pub transfer_syntaxes: Vec<String>,
    /// accept any abstract syntax regardless of the list above
    pub promiscuous: bool,
}

impl AcceptorPolicy {
    fn accepts_abstract_syntax(&self, uid: &str) -> bool {
        self.promiscuous || self.abstract_syntaxes.iter().any(|a| a == uid)
    }

    fn accepts_transfer_syntax(&self, uid: &str) -> bool {
        if self.transfer_syntaxes.is_empty() {
            self.registry.is_supported_transfer_syntax(uid)
        } else {
            self.transfer_syntaxes.iter().any(|t| t == uid)
                && self.registry.is_supported_transfer_syntax(uid)
        }
    }
}

/// The outcome of negotiating a set of proposed presentation contexts.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationOutcome {
    /// the association may proceed;
    /// one result per proposed context, in proposal order
    Accepted {
        contexts: Vec<PresentationContextNegotiated>,
    },
    /// the proposal was malformed and the whole association is refused
    Rejected(AssociationRJ),
}

/// Negotiate the proposed presentation contexts against the given policy.
///
/// Context identifiers must be odd and unique within the proposal;
/// a violation refuses the association as a whole.
/// Individual contexts whose abstract syntax is not provided
/// or for which no proposed transfer syntax is acceptable
/// are answered with the corresponding rejection reason,
/// never failing the rest of the negotiation.
pub fn negotiate(
    policy: &AcceptorPolicy,
    proposed: &[PresentationContextProposed],
) -> NegotiationOutcome {
    let mut seen_ids = HashSet::new();
    for pc in proposed {
        if pc.id % 2 == 0 || !seen_ids.insert(pc.id) {
            debug!(
                "refusing association: bad presentation context identifier {}",
                pc.id
            );
            return NegotiationOutcome::Rejected(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAsce(
                    AssociationRJServiceProviderAsceReason::NoReasonGiven,
                ),
            });
        }
    }

    let contexts = proposed
        .iter()
        .map(|pc| negotiate_context(policy, pc))
        .collect();

    NegotiationOutcome::Accepted { contexts }
}

fn negotiate_context(
    policy: &AcceptorPolicy,
    pc: &PresentationContextProposed,
) -> PresentationContextNegotiated {
    if !policy.accepts_abstract_syntax(&pc.abstract_syntax) {
        debug!(
            "rejecting presentation context {}: abstract syntax {} not provided",
            pc.id, pc.abstract_syntax
        );
        return PresentationContextNegotiated {
            id: pc.id,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            transfer_syntax: REJECTION_PLACEHOLDER_TS.to_string(),
            abstract_syntax: pc.abstract_syntax.clone(),
        };
    }

    // take the first proposed transfer syntax the policy can converse in,
    // honoring the requester's preference order
    match pc
        .transfer_syntaxes
        .iter()
        .find(|ts| policy.accepts_transfer_syntax(ts))
    {
        Some(ts) => PresentationContextNegotiated {
            id: pc.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: ts.clone(),
            abstract_syntax: pc.abstract_syntax.clone(),
        },
        None => {
            debug!(
                "rejecting presentation context {}: no acceptable transfer syntax",
                pc.id
            );
            PresentationContextNegotiated {
                id: pc.id,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: REJECTION_PLACEHOLDER_TS.to_string(),
                abstract_syntax: pc.abstract_syntax.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    fn policy(abstract_syntaxes: &[&str]) -> AcceptorPolicy {
        AcceptorPolicy {
            registry: Arc::new(UidRegistry::new_with_standard_entries()),
            abstract_syntaxes: abstract_syntaxes.iter().map(|s| s.to_string()).collect(),
            transfer_syntaxes: vec![],
            promiscuous: false,
        }
    }

    fn proposed(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn accepts_known_context_with_preferred_transfer_syntax() {
        let policy = policy(&[registry::VERIFICATION]);
        let outcome = negotiate(
            &policy,
            &[proposed(
                1,
                registry::VERIFICATION,
                &[
                    registry::EXPLICIT_VR_LITTLE_ENDIAN,
                    registry::IMPLICIT_VR_LITTLE_ENDIAN,
                ],
            )],
        );
        let contexts = match outcome {
            NegotiationOutcome::Accepted { contexts } => contexts,
            outcome => panic!("unexpected outcome {:?}", outcome),
        };
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].id, 1);
        assert_eq!(
            contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
        // the requester's first acceptable choice wins
        assert_eq!(
            contexts[0].transfer_syntax,
            registry::EXPLICIT_VR_LITTLE_ENDIAN
        );
        assert_eq!(contexts[0].abstract_syntax, registry::VERIFICATION);
    }

    #[test]
    fn rejects_unknown_abstract_syntax_per_context() {
        let policy = policy(&[registry::VERIFICATION]);
        let outcome = negotiate(
            &policy,
            &[
                proposed(1, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposed(3, "1.2.999.1", &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
            ],
        );
        let contexts = match outcome {
            NegotiationOutcome::Accepted { contexts } => contexts,
            outcome => panic!("unexpected outcome {:?}", outcome),
        };
        assert_eq!(contexts.len(), 2);
        assert_eq!(
            contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
        assert_eq!(
            contexts[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(contexts[1].transfer_syntax, "1.2.840.10008.1.2");
    }

    #[test]
    fn promiscuous_policy_accepts_any_abstract_syntax() {
        let mut policy = policy(&[]);
        policy.promiscuous = true;
        let outcome = negotiate(
            &policy,
            &[proposed(1, "1.2.999.1", &[registry::IMPLICIT_VR_LITTLE_ENDIAN])],
        );
        assert!(matches!(
            outcome,
            NegotiationOutcome::Accepted { contexts }
                if contexts[0].reason == PresentationContextResultReason::Acceptance
        ));
    }

    #[test]
    fn rejects_unacceptable_transfer_syntaxes_per_context() {
        let mut policy = policy(&[registry::VERIFICATION]);
        policy.transfer_syntaxes = vec![registry::IMPLICIT_VR_LITTLE_ENDIAN.to_string()];
        let outcome = negotiate(
            &policy,
            &[proposed(
                1,
                registry::VERIFICATION,
                &[registry::EXPLICIT_VR_LITTLE_ENDIAN],
            )],
        );
        assert!(matches!(
            outcome,
            NegotiationOutcome::Accepted { contexts }
                if contexts[0].reason
                    == PresentationContextResultReason::TransferSyntaxesNotSupported
        ));
    }

    #[test]
    fn even_context_identifier_refuses_association() {
        let policy = policy(&[registry::VERIFICATION]);
        let outcome = negotiate(
            &policy,
            &[proposed(2, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN])],
        );
        assert!(matches!(
            outcome,
            NegotiationOutcome::Rejected(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAsce(
                    AssociationRJServiceProviderAsceReason::NoReasonGiven
                ),
            })
        ));
    }

    #[test]
    fn duplicate_context_identifier_refuses_association() {
        let policy = policy(&[registry::VERIFICATION]);
        let outcome = negotiate(
            &policy,
            &[
                proposed(1, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposed(1, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
            ],
        );
        assert!(matches!(outcome, NegotiationOutcome::Rejected(_)));
    }

    #[test]
    fn results_keep_proposal_order() {
        let policy = policy(&[registry::VERIFICATION]);
        let outcome = negotiate(
            &policy,
            &[
                proposed(5, "1.2.999.1", &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposed(1, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposed(3, registry::VERIFICATION, &[registry::IMPLICIT_VR_LITTLE_ENDIAN]),
            ],
        );
        let contexts = match outcome {
            NegotiationOutcome::Accepted { contexts } => contexts,
            outcome => panic!("unexpected outcome {:?}", outcome),
        };
        let ids: Vec<u8> = contexts.iter().map(|pc| pc.id).collect();
        assert_eq!(ids, vec![5, 1, 3]);
    }
}
