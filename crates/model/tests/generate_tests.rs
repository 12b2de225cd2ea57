mod common;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use candle_core::DType;
use common::{batch, build_model, random_rows, Options, RAW_INPUT, STEP_INPUT};
use model::QuerySeed;
use rand::{rngs::StdRng, SeedableRng};

fn zero_steps(len: usize) -> Result<attention::SeqBatch> {
    let rows = vec![vec![vec![0.0; STEP_INPUT]; len]];
    batch(STEP_INPUT, &rows)
}

fn check_stream_matches_apply(seed: QuerySeed) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(51);
    let (model, _) = build_model(Options {
        seed,
        ..Options::default()
    })?;
    let input = batch(RAW_INPUT, &random_rows(&mut rng, RAW_INPUT, &[4]))?;
    let primed = seed == QuerySeed::Primed;
    let expected = model
        .apply(&input, &zero_steps(if primed { 6 } else { 5 })?)?
        .outputs()
        .to_rows()?;

    let mut generator = model.generate(&input)?;
    for row in &expected[0] {
        let output = generator.next().expect("stream never ends")?;
        let output = output.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        for (a, b) in output.iter().zip(row) {
            assert!((a - b).abs() < 1e-10);
        }
    }
    generator.cancel();
    Ok(())
}

#[test]
fn stream_matches_batch_apply_with_learned_query() -> Result<()> {
    check_stream_matches_apply(QuerySeed::Learned)
}

#[test]
fn stream_skips_priming_step() -> Result<()> {
    check_stream_matches_apply(QuerySeed::Primed)
}

#[test]
fn cancel_stops_output_and_joins_worker() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(52);
    let (model, _) = build_model(Options::default())?;
    let input = batch(RAW_INPUT, &random_rows(&mut rng, RAW_INPUT, &[3]))?;
    let mut generator = model.generate(&input)?;
    for _ in 0..3 {
        assert!(generator.next_output().is_some());
    }
    let started = Instant::now();
    generator.cancel();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(generator.is_cancelled());
    assert!(generator.next_output().is_none());
    assert!(generator.next().is_none());
    Ok(())
}

#[test]
fn token_cancels_from_another_thread() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(55);
    let (model, _) = build_model(Options::default())?;
    let input = batch(RAW_INPUT, &random_rows(&mut rng, RAW_INPUT, &[3]))?;
    let mut generator = model.generate(&input)?;
    let token = generator.cancel_token();
    assert!(generator.next_output().is_some());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        token.cancel();
    });
    let started = Instant::now();
    while let Some(output) = generator.next_output() {
        output?;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
    canceller.join().expect("canceller thread");
    assert!(generator.is_cancelled());
    assert!(generator.next().is_none());
    Ok(())
}

#[test]
fn dropping_an_idle_consumer_does_not_hang() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(53);
    let (model, _) = build_model(Options::default())?;
    let input = batch(RAW_INPUT, &random_rows(&mut rng, RAW_INPUT, &[2]))?;
    let generator = model.generate(&input)?;
    // let the worker block on its first hand-off
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    drop(generator);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn generation_needs_exactly_one_lane() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(54);
    let (model, _) = build_model(Options::default())?;
    let input = batch(RAW_INPUT, &random_rows(&mut rng, RAW_INPUT, &[2, 2]))?;
    let err = model.generate(&input).err().expect("two lanes");
    assert!(err.is_contract_violation());
    Ok(())
}
