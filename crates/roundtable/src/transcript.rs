//! Live transcript of a session, printed from the event bus.

use std::io::Write;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use turn_coordination::events::FilteredReceiver;
use turn_coordination::{EndReason, TriggerKind, TurnEvent};

/// Counts gathered while following a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptSummary {
    pub utterances: usize,
    pub reactive_turns: usize,
    pub dropped_triggers: usize,
    pub failed_generations: usize,
    pub end_reason: Option<EndReason>,
}

/// One transcript line for `event`, or `None` if it is not shown.
///
/// Quiet mode shows utterances and the ending only.
pub fn format_event(event: &TurnEvent, quiet: bool) -> Option<String> {
    match event {
        TurnEvent::SessionStarted {
            participants,
            topic,
            ..
        } => Some(format!("=== {} on \"{}\" ===", participants.join(", "), topic)),
        TurnEvent::UtteranceFinalized {
            agent_id,
            trigger,
            text,
            emotion,
            ..
        } => {
            let marker = match trigger {
                TriggerKind::Reactive => " ↩",
                _ => "",
            };
            let mood = emotion
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            Some(format!("{agent_id}{marker}{mood}: {text}"))
        }
        TurnEvent::SessionEnded {
            reason,
            rounds,
            total_speeches,
            ..
        } => Some(format!(
            "=== ended: {reason} after {rounds} rounds, {total_speeches} speeches ==="
        )),
        _ if quiet => None,
        TurnEvent::TriggerScheduled {
            agent_id, delay_ms, ..
        } => Some(format!("   [{agent_id} wants to respond in {delay_ms} ms]")),
        TurnEvent::TriggerDropped {
            agent_id, reason, ..
        } => Some(format!(
            "   [{} stood down: {}]",
            agent_id.as_deref().unwrap_or("?"),
            reason
        )),
        TurnEvent::GenerationFailed {
            agent_id, error, ..
        } => Some(format!("   [{agent_id} lost their train of thought: {error}]")),
        _ => None,
    }
}

/// Print events until the session ends or the bus closes.
pub async fn follow<W: Write>(
    mut events: FilteredReceiver,
    out: &mut W,
    quiet: bool,
) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Transcript fell behind the event bus");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            TurnEvent::UtteranceFinalized { trigger, .. } => {
                summary.utterances += 1;
                if *trigger == TriggerKind::Reactive {
                    summary.reactive_turns += 1;
                }
            }
            TurnEvent::TriggerDropped { .. } => summary.dropped_triggers += 1,
            TurnEvent::GenerationFailed { .. } => summary.failed_generations += 1,
            TurnEvent::SessionEnded { reason, .. } => summary.end_reason = Some(reason.clone()),
            _ => {}
        }

        if let Some(line) = format_event(&event, quiet) {
            if let Err(e) = writeln!(out, "{line}") {
                warn!("Failed to write transcript line: {}", e);
            }
        }
        if summary.end_reason.is_some() {
            break;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use turn_coordination::{EventBus, EventFilter};
    use turn_coordination::DropReason;

    fn utterance(agent: &str, trigger: TriggerKind) -> TurnEvent {
        TurnEvent::UtteranceFinalized {
            session_id: "s1".into(),
            agent_id: agent.into(),
            trigger,
            seq: 1,
            text: "Bridges are promises.".into(),
            emotion: Some("thinking".into()),
            duration_ms: 2_000,
            timestamp: Utc::now(),
        }
    }

    fn dropped() -> TurnEvent {
        TurnEvent::TriggerDropped {
            session_id: "s1".into(),
            trigger_id: "t1".into(),
            agent_id: Some("flint".into()),
            reason: DropReason::SpeechStartedSince,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_format_utterance() {
        assert_eq!(
            format_event(&utterance("sage", TriggerKind::Autonomous), true).unwrap(),
            "sage (thinking): Bridges are promises."
        );
        assert_eq!(
            format_event(&utterance("spark", TriggerKind::Reactive), false).unwrap(),
            "spark ↩ (thinking): Bridges are promises."
        );
    }

    #[test]
    fn test_quiet_hides_bookkeeping() {
        assert!(format_event(&dropped(), true).is_none());
        let line = format_event(&dropped(), false).unwrap();
        assert!(line.contains("flint stood down: speech_started_since"));
    }

    #[tokio::test]
    async fn test_follow_until_session_ends() {
        let bus = EventBus::new().shared();
        let events = bus.subscribe_filtered(EventFilter::new().session("s1"));

        bus.publish(utterance("sage", TriggerKind::Requested));
        bus.publish(dropped());
        bus.publish(utterance("spark", TriggerKind::Reactive));
        bus.publish(TurnEvent::SessionEnded {
            session_id: "s1".into(),
            reason: EndReason::MaxRounds { rounds: 2 },
            rounds: 2,
            total_speeches: 2,
            timestamp: Utc::now(),
        });

        let mut out = Vec::new();
        let summary = follow(events, &mut out, false).await;

        assert_eq!(summary.utterances, 2);
        assert_eq!(summary.reactive_turns, 1);
        assert_eq!(summary.dropped_triggers, 1);
        assert_eq!(summary.end_reason, Some(EndReason::MaxRounds { rounds: 2 }));

        let printed = String::from_utf8(out).unwrap();
        assert_eq!(printed.lines().count(), 4);
        assert!(printed.ends_with("after 2 rounds, 2 speeches ===\n"));
    }
}
