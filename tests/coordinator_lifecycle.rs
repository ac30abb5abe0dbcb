use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use syncbatch::{
    BatchActivity, BatchCoordinator, BatchCoordinatorBuilder, BatchSink, ChannelError,
    ChannelState, CompositeBatch, ConfigError, ConfigKnob, CoordinatorConfig, CoordinatorPhase,
    DeliveryError, Item, PushError,
};

const LONG: Duration = Duration::from_secs(30);

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Batch { sequence: u64, mask: u64 },
    FlushStart,
    FlushStop,
    EndOfStream,
}

#[derive(Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingSink {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl BatchSink for RecordingSink {
    fn deliver(&mut self, batch: CompositeBatch) -> Result<(), DeliveryError> {
        self.seen.lock().unwrap().push(Seen::Batch {
            sequence: batch.sequence(),
            mask: batch.mask().bits(),
        });
        Ok(())
    }

    fn flush(&mut self, started: bool) {
        let signal = if started {
            Seen::FlushStart
        } else {
            Seen::FlushStop
        };
        self.seen.lock().unwrap().push(signal);
    }

    fn end_of_stream(&mut self) {
        self.seen.lock().unwrap().push(Seen::EndOfStream);
    }
}

fn coordinator(name: &str, config: CoordinatorConfig) -> (BatchCoordinator, RecordingSink) {
    let sink = RecordingSink::default();
    let coordinator = BatchCoordinatorBuilder::new(name)
        .config(config)
        .sink(sink.clone())
        .build();
    (coordinator, sink)
}

#[test]
fn channels_start_idle_and_arm_on_start() {
    let (coordinator, _sink) = coordinator("arm", CoordinatorConfig::default());
    let a = coordinator.create_channel().unwrap();
    assert_eq!(coordinator.channel_state(a).unwrap(), ChannelState::Idle);
    assert_eq!(coordinator.phase(), CoordinatorPhase::Stopped);

    coordinator.start().unwrap();
    coordinator.start().unwrap();
    assert_eq!(coordinator.phase(), CoordinatorPhase::Running);
    assert_eq!(coordinator.channel_state(a).unwrap(), ChannelState::Active);

    coordinator.stop().unwrap();
    assert_eq!(coordinator.channel_state(a).unwrap(), ChannelState::Idle);
    assert!(coordinator
        .activity_log()
        .activities()
        .contains(&BatchActivity::Stopped));
}

#[test]
fn explicit_indices_are_validated() {
    let (coordinator, _sink) = coordinator("indices", CoordinatorConfig::default());
    assert_eq!(
        coordinator.create_channel_at(64),
        Err(ChannelError::IndexOutOfRange(64))
    );
    let five = coordinator.create_channel_at(5).unwrap();
    assert_eq!(five.index(), 5);
    assert_eq!(five.to_string(), "sink_5");
    assert_eq!(
        coordinator.create_channel_at(5),
        Err(ChannelError::IndexInUse(5))
    );
    assert_eq!(coordinator.create_channel().unwrap().index(), 6);
}

#[test]
fn remove_is_refused_while_channel_is_live() {
    let (coordinator, _sink) = coordinator("remove", CoordinatorConfig::default());
    let a = coordinator.create_channel().unwrap();
    let b = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();

    assert_eq!(coordinator.remove_channel(a), Err(ChannelError::Busy(a)));
    coordinator.mark_eos(a).unwrap();
    coordinator.remove_channel(a).unwrap();
    assert_eq!(
        coordinator.channel_len(a),
        Err(ChannelError::Unknown(a))
    );
    // Released indices are not reused while running.
    assert_ne!(coordinator.create_channel().unwrap(), a);
    assert!(coordinator.channel_state(b).is_ok());
}

#[test]
fn flushing_and_eos_hand_items_back() {
    let (coordinator, _sink) = coordinator("reject", CoordinatorConfig::default());
    let a = coordinator.create_channel().unwrap();
    let b = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();

    coordinator.flush_start(a).unwrap();
    let err = coordinator.push(a, Item::new(vec![4u8])).unwrap_err();
    assert!(matches!(err, PushError::Flushing { .. }));
    assert_eq!(err.into_item().payload(), &[4]);

    coordinator.mark_eos(b).unwrap();
    let err = coordinator.push(b, Item::new(vec![5u8])).unwrap_err();
    assert!(matches!(err, PushError::EndOfStream { .. }));
    assert_eq!(coordinator.metrics().pushes_rejected(), 2);
    assert!(matches!(
        coordinator.set_idle(b, true),
        Err(ChannelError::InvalidTransition { .. })
    ));
}

#[test]
fn flush_signals_reach_the_sink_once_all_channels_flush() {
    let (coordinator, sink) = coordinator("flush", CoordinatorConfig::new(1, 1, LONG).unwrap());
    let a = coordinator.create_channel().unwrap();
    let b = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();

    coordinator.push(a, Item::new(vec![1u8])).unwrap();
    coordinator.flush_start(a).unwrap();
    assert_eq!(coordinator.channel_len(a).unwrap(), 0);
    coordinator.flush_start(b).unwrap();
    coordinator.flush_stop(a).unwrap();
    coordinator.flush_stop(b).unwrap();
    assert!(coordinator.wait_egress_idle(Duration::from_secs(2)));
    assert_eq!(sink.seen(), vec![Seen::FlushStart, Seen::FlushStop]);

    coordinator.push(a, Item::new(vec![2u8])).unwrap();
    coordinator.push(b, Item::new(vec![3u8])).unwrap();
    wait_for(Duration::from_secs(2), || sink.seen().len() == 3);
    assert_eq!(
        sink.seen()[2],
        Seen::Batch {
            sequence: 0,
            mask: 0b11
        }
    );
}

#[test]
fn eos_waits_for_complete_windows_then_signals() {
    let config = CoordinatorConfig::new(1, 1, Duration::from_millis(50)).unwrap();
    let (coordinator, sink) = coordinator("eos", config);
    let a = coordinator.create_channel().unwrap();
    let b = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();

    coordinator.push(a, Item::new(vec![1u8])).unwrap();
    // A still holds a full window; the deadline fallback has to consume it first.
    coordinator.mark_eos(a).unwrap();
    assert_eq!(coordinator.channel_state(a).unwrap(), ChannelState::Eos);
    wait_for(Duration::from_secs(1), || !sink.seen().is_empty());
    assert_eq!(
        sink.seen()[0],
        Seen::Batch {
            sequence: 0,
            mask: 0b01
        }
    );

    coordinator.mark_eos(b).unwrap();
    coordinator.mark_eos(b).unwrap();
    wait_for(Duration::from_secs(2), || {
        sink.seen().last() == Some(&Seen::EndOfStream)
    });
    let eos = sink
        .seen()
        .iter()
        .filter(|seen| **seen == Seen::EndOfStream)
        .count();
    assert_eq!(eos, 1);
}

#[test]
fn drain_discards_backlog() {
    let (coordinator, _sink) = coordinator("drain", CoordinatorConfig::new(3, 1, LONG).unwrap());
    let a = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();
    coordinator.push(a, Item::new(vec![1u8])).unwrap();
    coordinator.push(a, Item::new(vec![2u8])).unwrap();

    assert_eq!(coordinator.drain_channel(a).unwrap(), 2);
    assert_eq!(coordinator.channel_len(a).unwrap(), 0);
    assert_eq!(coordinator.channel_state(a).unwrap(), ChannelState::Active);
    assert_eq!(coordinator.metrics().items_discarded(), 2);
}

#[test]
fn moving_window_is_hot_while_depth_needs_restart() {
    let (coordinator, _sink) = coordinator("knobs", CoordinatorConfig::new(4, 1, LONG).unwrap());
    coordinator.start().unwrap();

    coordinator.set_moving_window_size(3).unwrap();
    assert_eq!(coordinator.config().moving_window_size(), 3);
    assert!(matches!(
        coordinator.set_moving_window_size(5),
        Err(ConfigError::MovingWindowExceedsDepth { .. })
    ));

    let deeper = CoordinatorConfig::new(8, 3, LONG).unwrap();
    assert!(matches!(
        coordinator.reconfigure(deeper),
        Err(ConfigError::RequiresRestart {
            knob: ConfigKnob::Depth
        })
    ));
    coordinator.stop().unwrap();
    coordinator.reconfigure(deeper).unwrap();
    assert_eq!(coordinator.config().depth(), 8);
}

#[test]
fn restart_resets_sequence_and_position() {
    let (coordinator, sink) = coordinator("restart", CoordinatorConfig::new(1, 1, LONG).unwrap());
    let a = coordinator.create_channel().unwrap();

    for round in 0..2 {
        coordinator.start().unwrap();
        coordinator.push(a, Item::new(vec![round as u8])).unwrap();
        wait_for(Duration::from_secs(2), || sink.seen().len() == round + 1);
        assert_eq!(coordinator.position(), LONG);
        coordinator.stop().unwrap();
        assert_eq!(coordinator.position(), Duration::ZERO);
    }
    assert_eq!(
        sink.seen(),
        vec![
            Seen::Batch {
                sequence: 0,
                mask: 0b1
            },
            Seen::Batch {
                sequence: 0,
                mask: 0b1
            }
        ]
    );
}

#[test]
fn metrics_render_prometheus_text() {
    let (coordinator, sink) = coordinator("render", CoordinatorConfig::new(1, 1, LONG).unwrap());
    let a = coordinator.create_channel().unwrap();
    coordinator.start().unwrap();
    coordinator.push(a, Item::new(vec![1u8])).unwrap();
    wait_for(Duration::from_secs(2), || sink.seen().len() == 1);
    assert!(coordinator.wait_egress_idle(Duration::from_secs(1)));

    let rendered = coordinator.render_metrics();
    assert!(rendered.contains("syncbatch_batches_assembled_total 1\n"));
    assert!(rendered.contains("syncbatch_batches_delivered_total 1\n"));
    assert!(rendered.contains("syncbatch_egress_depth 0\n"));
}

#[test]
fn backlog_queued_while_stopped_arms_the_deadline() {
    let config = CoordinatorConfig::new(1, 1, Duration::from_millis(40)).unwrap();
    let (coordinator, sink) = coordinator("backlog", config);
    let a = coordinator.create_channel().unwrap();
    let _b = coordinator.create_channel().unwrap();
    coordinator.push(a, Item::new(vec![1u8])).unwrap();
    assert_eq!(coordinator.channel_len(a).unwrap(), 1);

    coordinator.start().unwrap();
    wait_for(Duration::from_secs(2), || !sink.seen().is_empty());
    assert_eq!(
        sink.seen()[0],
        Seen::Batch {
            sequence: 0,
            mask: 0b01
        }
    );
}
