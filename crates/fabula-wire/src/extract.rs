//! Multi-chronicle decomposition
//!
//! A composite transaction may span several chronicles; each chronicle's
//! connection only ever sees the slice relevant to it. Extraction walks the
//! chronicle envelope, strips it, and keeps the sub-actions addressed to
//! the requested chronicle. A composite that collapses to a single
//! sub-action becomes indistinguishable from a simple event.

use fabula_core::{
    ChronicleUri, DeltaAspect, DeltaBody, EventAspects, FabulaError, FabulaResult,
};

/// Extract the slice of `event` relevant to `chronicle`.
///
/// Returns `None` when the event's envelope does not mention the chronicle
/// at all. An event with no envelope is context-free and passes through
/// unchanged.
pub fn extract_for_chronicle(
    event: EventAspects,
    chronicle: &ChronicleUri,
) -> FabulaResult<Option<EventAspects>> {
    let EventAspects {
        version,
        command,
        log,
        delta,
    } = event;
    let Some(delta) = extract_delta(delta, chronicle)? else {
        return Ok(None);
    };
    Ok(Some(EventAspects {
        version,
        command,
        log,
        delta,
    }))
}

fn extract_delta(
    delta: DeltaAspect,
    chronicle: &ChronicleUri,
) -> FabulaResult<Option<DeltaAspect>> {
    let Some(chronicles) = delta.chronicles else {
        // No envelope: single-chronicle payload, relevant as-is.
        return Ok(Some(delta));
    };
    if !chronicles.contains_key(chronicle) {
        return Ok(None);
    }

    match delta.body {
        DeltaBody::Mutate(mutation) => {
            if chronicles.len() > 1 {
                // Only composite actions may legally span chronicles.
                return Err(FabulaError::NonCompositeMultiChronicle {
                    chronicle: chronicle.clone(),
                    chronicles: chronicles.len(),
                });
            }
            Ok(Some(DeltaAspect {
                chronicles: None,
                body: DeltaBody::Mutate(mutation),
            }))
        }
        DeltaBody::Transacted { actions } => {
            let mut kept = Vec::with_capacity(actions.len());
            for action in actions {
                if let Some(extracted) = extract_delta(action, chronicle)? {
                    kept.push(extracted);
                }
            }
            match kept.len() {
                // The envelope claimed relevance but no sub-action agreed:
                // the event is internally inconsistent.
                0 => Err(FabulaError::EmptyExtraction {
                    chronicle: chronicle.clone(),
                }),
                // Composite-of-one collapses to the lone sub-action.
                1 => Ok(kept.pop()),
                _ => Ok(Some(DeltaAspect {
                    chronicles: None,
                    body: DeltaBody::Transacted { actions: kept },
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fabula_core::{ChronicleNote, CommandId, Mutation};

    use super::*;

    fn chronicle(id: &str) -> ChronicleUri {
        ChronicleUri::parse(&format!("memory://origin?id={id}")).unwrap()
    }

    fn two_chronicle_transaction() -> EventAspects {
        let a = chronicle("a");
        let b = chronicle("b");
        let action_a = DeltaAspect::mutate(Mutation::set("title", "alpha"))
            .with_chronicle(a.clone(), ChronicleNote::default());
        let action_b = DeltaAspect::mutate(Mutation::append("body", "beta"))
            .with_chronicle(b.clone(), ChronicleNote::default());
        let mut delta = DeltaAspect::transacted(vec![action_a, action_b]);
        let mut envelope = std::collections::BTreeMap::new();
        envelope.insert(a, ChronicleNote::at(0));
        envelope.insert(b, ChronicleNote::at(0));
        delta.chronicles = Some(envelope);
        EventAspects::command(CommandId::new(1), delta)
    }

    #[test]
    fn test_context_free_event_passes_through() {
        let event = EventAspects::command(
            CommandId::new(1),
            DeltaAspect::mutate(Mutation::set("title", "t")),
        );
        let extracted = extract_for_chronicle(event.clone(), &chronicle("a")).unwrap();
        assert_eq!(extracted, Some(event));
    }

    #[test]
    fn test_absent_chronicle_is_irrelevant() {
        let event = two_chronicle_transaction();
        let extracted = extract_for_chronicle(event, &chronicle("c")).unwrap();
        assert!(extracted.is_none());
    }

    #[test]
    fn test_composite_of_one_collapses() {
        let event = two_chronicle_transaction();
        let extracted = extract_for_chronicle(event, &chronicle("b"))
            .unwrap()
            .unwrap();
        // The TRANSACTED wrapper is gone: the slice equals action `b` with
        // its envelope stripped.
        assert!(extracted.delta.chronicles.is_none());
        assert_eq!(
            extracted.delta.body,
            DeltaBody::Mutate(Mutation::append("body", "beta"))
        );
    }

    #[test]
    fn test_decomposition_covers_both_chronicles() {
        let event = two_chronicle_transaction();
        let for_a = extract_for_chronicle(event.clone(), &chronicle("a"))
            .unwrap()
            .unwrap();
        let for_b = extract_for_chronicle(event, &chronicle("b"))
            .unwrap()
            .unwrap();
        assert_eq!(
            for_a.delta.body,
            DeltaBody::Mutate(Mutation::set("title", "alpha"))
        );
        assert_eq!(
            for_b.delta.body,
            DeltaBody::Mutate(Mutation::append("body", "beta"))
        );
        // Both slices keep the issuing command identity.
        assert_eq!(for_a.command_id(), for_b.command_id());
    }

    #[test]
    fn test_non_composite_spanning_chronicles_is_fatal() {
        let a = chronicle("a");
        let b = chronicle("b");
        let mut delta = DeltaAspect::mutate(Mutation::set("title", "t"));
        let mut envelope = std::collections::BTreeMap::new();
        envelope.insert(a.clone(), ChronicleNote::default());
        envelope.insert(b, ChronicleNote::default());
        delta.chronicles = Some(envelope);
        let event = EventAspects::command(CommandId::new(1), delta);
        let err = extract_for_chronicle(event, &a).unwrap_err();
        assert!(matches!(
            err,
            FabulaError::NonCompositeMultiChronicle { chronicles: 2, .. }
        ));
    }

    #[test]
    fn test_relevant_envelope_with_no_agreeing_subaction_is_fatal() {
        let a = chronicle("a");
        let b = chronicle("b");
        // Envelope claims `a`, but the only sub-action addresses `b`.
        let action = DeltaAspect::mutate(Mutation::set("x", "y"))
            .with_chronicle(b, ChronicleNote::default());
        let mut delta = DeltaAspect::transacted(vec![action]);
        let mut envelope = std::collections::BTreeMap::new();
        envelope.insert(a.clone(), ChronicleNote::default());
        delta.chronicles = Some(envelope);
        let event = EventAspects::command(CommandId::new(1), delta);
        let err = extract_for_chronicle(event, &a).unwrap_err();
        assert!(matches!(err, FabulaError::EmptyExtraction { .. }));
    }

    #[test]
    fn test_nested_composite_keeps_relative_order() {
        let a = chronicle("a");
        let b = chronicle("b");
        let first = DeltaAspect::mutate(Mutation::set("one", "1"))
            .with_chronicle(a.clone(), ChronicleNote::default());
        let foreign = DeltaAspect::mutate(Mutation::set("skip", "s"))
            .with_chronicle(b.clone(), ChronicleNote::default());
        let second = DeltaAspect::mutate(Mutation::set("two", "2"))
            .with_chronicle(a.clone(), ChronicleNote::default());
        let mut delta = DeltaAspect::transacted(vec![first, foreign, second]);
        let mut envelope = std::collections::BTreeMap::new();
        envelope.insert(a.clone(), ChronicleNote::default());
        envelope.insert(b, ChronicleNote::default());
        delta.chronicles = Some(envelope);
        let event = EventAspects::command(CommandId::new(1), delta);

        let extracted = extract_for_chronicle(event, &a).unwrap().unwrap();
        match extracted.delta.body {
            DeltaBody::Transacted { actions } => {
                assert_eq!(actions.len(), 2);
                assert_eq!(
                    actions[0].body,
                    DeltaBody::Mutate(Mutation::set("one", "1"))
                );
                assert_eq!(
                    actions[1].body,
                    DeltaBody::Mutate(Mutation::set("two", "2"))
                );
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }
}
