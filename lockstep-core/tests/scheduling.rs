use std::sync::Arc;

use candle_core::{Device, Tensor};
use lockstep_core::{
    CacheConfig, CacheError, Engine, EngineBuilder, EngineConfig, EngineError, EngineHandle,
    LocalFabric, MultimodalFeature, Request, Response, SamplingParams, SchedulerConfig,
    SequenceState, SimulatedModel, StepOutcome, Submission,
};
use tokio::sync::mpsc::error::TryRecvError;

const VOCAB: usize = 32;

fn config(num_blocks: usize, max_batch_tokens: usize) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            block_size: 4,
            num_blocks,
            ..Default::default()
        },
        scheduler: SchedulerConfig {
            max_batch_tokens,
            max_num_seqs: 8,
            max_seq_len: 256,
            ..Default::default()
        },
        idle_interval_ms: 5,
        ..Default::default()
    }
}

/// A single-replica engine driven by hand through [`Engine::step`].
fn engine(config: EngineConfig) -> (Engine, EngineHandle) {
    let fabric = LocalFabric::new(1, config.sync_timeout());
    let model = Arc::new(SimulatedModel::new(VOCAB, 8, 5));
    let backend = fabric.backends(model).remove(0);
    EngineBuilder::new(backend).with_config(config).build().unwrap()
}

fn prompt(len: usize) -> Vec<u32> {
    (0..len as u32).map(|t| t % VOCAB as u32).collect()
}

fn submit(handle: &EngineHandle, len: usize, max_new: usize) -> Submission {
    handle
        .submit(Request::new(prompt(len), SamplingParams::greedy(max_new)))
        .unwrap()
}

fn drain(sub: &mut Submission) -> Vec<Response> {
    let mut events = Vec::new();
    while let Ok(event) = sub.responses.try_recv() {
        events.push(event);
    }
    events
}

fn tokens_until_done(engine: &mut Engine, sub: &mut Submission) -> Vec<u32> {
    let mut tokens = Vec::new();
    for _ in 0..64 {
        engine.step().unwrap();
        for event in drain(sub) {
            match event {
                Response::Tokens { tokens: t, .. } => tokens.extend(t),
                Response::Done { .. } => return tokens,
                other => panic!("unexpected {other:?}"),
            }
        }
    }
    panic!("request {} did not finish", sub.id);
}

fn ran(outcome: StepOutcome) -> lockstep_core::StepReport {
    match outcome {
        StepOutcome::Ran(report) => report,
        other => panic!("expected a batch, got {other:?}"),
    }
}

#[test]
fn prompts_within_budget_are_admitted_together() {
    let (mut engine, handle) = engine(config(64, 60));
    let subs: Vec<_> = [5, 50, 5].iter().map(|&n| submit(&handle, n, 4)).collect();

    let report = ran(engine.step().unwrap());
    assert_eq!(report.prefill_tokens, 60);
    assert_eq!(report.generated, 3);
    for sub in &subs {
        assert_eq!(
            handle.request_state(sub.id),
            Some(SequenceState::RunningCompletion)
        );
    }
}

#[test]
fn fifo_admission_defers_the_newest_arrival() {
    let (mut engine, handle) = engine(config(64, 59));
    let subs: Vec<_> = [5, 50, 5].iter().map(|&n| submit(&handle, n, 4)).collect();

    let report = ran(engine.step().unwrap());
    assert_eq!(report.prefill_tokens, 55);
    assert_eq!(
        handle.request_state(subs[0].id),
        Some(SequenceState::RunningCompletion)
    );
    assert_eq!(
        handle.request_state(subs[1].id),
        Some(SequenceState::RunningCompletion)
    );
    assert_eq!(handle.request_state(subs[2].id), Some(SequenceState::Waiting));

    let report = ran(engine.step().unwrap());
    assert_eq!(report.decode_tokens, 2);
    assert_eq!(report.prefill_tokens, 5);
    assert_eq!(handle.num_waiting(), 0);
}

#[test]
fn prompt_larger_than_the_pool_is_errored() {
    let (mut engine, handle) = engine(config(4, 64));
    let mut big = submit(&handle, 20, 4);
    let mut small = submit(&handle, 6, 2);

    let report = ran(engine.step().unwrap());
    assert_eq!(report.prefill_tokens, 6);
    let events = drain(&mut big);
    assert!(matches!(
        events.as_slice(),
        [Response::Error {
            error: EngineError::OutOfMemory(CacheError::ExceedsCapacity {
                requested: 5,
                capacity: 4
            }),
            ..
        }]
    ));
    assert_eq!(handle.request_state(big.id), None);
    // Only the small request holds blocks.
    assert_eq!(handle.kv_cache_info().used_blocks, 2);
    assert!(matches!(drain(&mut small).as_slice(), [Response::Tokens { .. }]));
}

#[test]
fn cancel_mid_decode_stops_the_stream_and_frees_blocks() {
    let (mut engine, handle) = engine(config(16, 64));
    let mut sub = submit(&handle, 6, 100);
    for _ in 0..3 {
        ran(engine.step().unwrap());
    }
    assert_eq!(drain(&mut sub).len(), 3);
    assert!(handle.kv_cache_info().used_blocks > 0);

    assert!(handle.cancel(sub.id));
    assert_eq!(engine.step().unwrap(), StepOutcome::Idle);
    assert!(matches!(
        sub.responses.try_recv(),
        Ok(Response::Cancelled { .. })
    ));
    assert_eq!(sub.responses.try_recv(), Err(TryRecvError::Disconnected));
    assert_eq!(handle.kv_cache_info().used_blocks, 0);
    assert_eq!(handle.request_state(sub.id), None);
    assert!(!handle.cancel(sub.id));
}

#[test]
fn dropping_the_stream_cancels_the_request() {
    let (mut engine, handle) = engine(config(16, 64));
    let sub = submit(&handle, 6, 100);
    ran(engine.step().unwrap());
    drop(sub);
    assert_eq!(engine.step().unwrap(), StepOutcome::Idle);
    assert_eq!(handle.num_running(), 0);
    assert_eq!(handle.kv_cache_info().used_blocks, 0);
}

#[test]
fn generated_tokens_grow_one_at_a_time_until_done() {
    let (mut engine, handle) = engine(config(8, 64));
    let mut subs: Vec<_> = (0..4).map(|i| submit(&handle, 3 + i, 6)).collect();
    let mut seen = vec![0usize; subs.len()];
    let mut finished = vec![false; subs.len()];

    for _ in 0..64 {
        if finished.iter().all(|f| *f) {
            break;
        }
        engine.step().unwrap();
        for (i, sub) in subs.iter_mut().enumerate() {
            for event in drain(sub) {
                assert!(!finished[i], "event after the terminal one: {event:?}");
                match event {
                    Response::Tokens { index, tokens, .. } => {
                        assert_eq!(index, seen[i]);
                        seen[i] += tokens.len();
                    }
                    Response::Done { usage, .. } => {
                        assert_eq!(usage.completion_tokens, seen[i]);
                        finished[i] = true;
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }
    assert!(finished.iter().all(|f| *f));
    assert_eq!(seen, vec![6; 4]);
    assert_eq!(handle.kv_cache_info().used_blocks, 0);
}

#[test]
fn execution_fault_errors_the_batch_and_the_loop_continues() {
    let (mut engine, handle) = engine(config(16, 64));
    let mut good = submit(&handle, 4, 2);
    // The last prompt token is outside the vocabulary.
    let mut bad = handle
        .submit(Request::new(vec![1, 2, VOCAB as u32 + 3], SamplingParams::greedy(2)))
        .unwrap();

    assert_eq!(engine.step().unwrap(), StepOutcome::Faulted);
    for sub in [&mut good, &mut bad] {
        assert!(matches!(
            drain(sub).as_slice(),
            [Response::Error {
                error: EngineError::ExecutionFault(_),
                ..
            }]
        ));
    }
    assert_eq!(handle.kv_cache_info().used_blocks, 0);
    assert_eq!(handle.stats().execution_faults, 1);

    let mut next = submit(&handle, 4, 2);
    ran(engine.step().unwrap());
    ran(engine.step().unwrap());
    let events = drain(&mut next);
    assert!(matches!(events.last(), Some(Response::Done { .. })));
    assert!(handle.last_fatal().is_none());
}

#[test]
fn invalid_requests_get_an_immediate_error() {
    let (_engine, handle) = engine(config(16, 64));
    let mut empty = handle
        .submit(Request::new(Vec::new(), SamplingParams::greedy(2)))
        .unwrap();
    assert!(matches!(
        empty.responses.try_recv(),
        Ok(Response::Error {
            error: EngineError::InvalidRequest(_),
            ..
        })
    ));

    let mut unknown = handle
        .submit(Request::new(vec![1, 2], SamplingParams::greedy(2)).with_adapter(9))
        .unwrap();
    assert!(matches!(
        unknown.responses.try_recv(),
        Ok(Response::Error {
            error: EngineError::AdapterNotFound(9),
            ..
        })
    ));
    assert_eq!(handle.num_waiting(), 0);
}

#[test]
fn shutdown_errors_queued_requests() {
    let (mut engine, handle) = engine(config(16, 64));
    let mut sub = submit(&handle, 4, 8);
    handle.shutdown().unwrap();
    assert_eq!(engine.step().unwrap(), StepOutcome::Shutdown);
    assert!(matches!(
        drain(&mut sub).as_slice(),
        [Response::Error {
            error: EngineError::Shutdown,
            ..
        }]
    ));
    assert!(matches!(
        handle.submit(Request::new(vec![1], SamplingParams::greedy(1))),
        Err(EngineError::Shutdown)
    ));
}

#[test]
fn preemption_does_not_change_the_tokens_of_a_multimodal_request() {
    let rows = Tensor::full(0.75f32, (1, 8), &Device::Cpu).unwrap();
    let request = || {
        Request::new(prompt(4), SamplingParams::greedy(6))
            .with_feature(MultimodalFeature::new(3, &rows).unwrap())
    };

    let alone = {
        let (mut engine, handle) = engine(EngineConfig {
            multimodal_feature_dim: Some(8),
            ..config(64, 64)
        });
        let mut sub = handle.submit(request()).unwrap();
        let tokens = tokens_until_done(&mut engine, &mut sub);
        assert_eq!(handle.stats().preemptions, 0);
        tokens
    };

    // 3 blocks of 4 tokens: both prompts fit, but only the earlier request can
    // grow, so the multimodal one is preempted and recomputed later.
    let (mut engine, handle) = engine(EngineConfig {
        multimodal_feature_dim: Some(8),
        ..config(3, 64)
    });
    let _first = submit(&handle, 4, 8);
    let mut sub = handle.submit(request()).unwrap();
    let preempted = tokens_until_done(&mut engine, &mut sub);

    assert_eq!(handle.stats().preemptions, 1);
    assert_eq!(alone.len(), 6);
    assert_eq!(alone, preempted);
}
