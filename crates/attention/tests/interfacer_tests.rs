mod common;

use std::sync::Arc;

use anyhow::Result;
use attention::{
    AttentionError, BlockState, Combiner, CombinerConfig, Config, Decoder, FocusFunction,
    Gradients, InputMixing, InterfacerBlock, StartQuery,
};
use candle_core::{DType, Device, Tensor, Var};
use common::{
    assert_close, attentor, batch, bound_resources, flat, numeric_grad, random_rows,
    weighted_loss, TanhCell,
};
use layers::LinearInit;
use rand::{rngs::StdRng, Rng, SeedableRng};

const QUERY: usize = 3;
const ENCODED: usize = 2;
const INPUT: usize = 2;
const STATE: usize = 4;
const VISIBLE: usize = 2;

fn start_query() -> Result<Var> {
    Ok(Var::new(&[0.1f64, -0.2, 0.3], &Device::Cpu)?)
}

struct Fixture {
    block: InterfacerBlock<FocusFunction>,
    attentor: Arc<Combiner>,
    encoded: Vec<Var>,
    query: Var,
}

fn concat_block(encoded_lengths: &[usize], rng: &mut StdRng) -> Result<Fixture> {
    let attentor = attentor(QUERY, ENCODED, 4)?;
    let encoded = batch(ENCODED, &random_rows(rng, ENCODED, encoded_lengths))?;
    let (resources, encoded_vars) = bound_resources(&attentor, &encoded, &Config::default())?;
    let decoder: Arc<dyn Decoder> =
        Arc::new(TanhCell::new(ENCODED + INPUT, STATE, QUERY + VISIBLE)?);
    let query = start_query()?;
    let block = InterfacerBlock::new(
        resources,
        decoder,
        InputMixing::Concat,
        StartQuery::Learned(query.clone()),
    )?;
    Ok(Fixture {
        block,
        attentor,
        encoded: encoded_vars,
        query,
    })
}

#[test]
fn run_matches_manual_stepping() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let block = concat_block(&[3, 5], &mut rng)?.block;
    let rows = random_rows(&mut rng, INPUT, &[4, 4]);
    let inputs = batch(INPUT, &rows)?;
    let run = block.run(&inputs)?;

    let mut state = block.start_state();
    for t in 0..4 {
        let (_, input) = inputs.timestep(t)?;
        let step = block.step(&state, &input)?;
        let expected = step.output.to_vec2::<f64>()?;
        for lane in 0..2 {
            let actual = run.outputs().lanes()[lane].narrow(0, t, 1)?.to_vec2::<f64>()?;
            for (a, b) in actual[0].iter().zip(&expected[lane]) {
                assert!((a - b).abs() < 1e-12);
            }
        }
        state = step.state;
    }
    Ok(())
}

#[test]
fn stepping_lets_lanes_finish_early() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(13);
    let block = concat_block(&[2, 3, 4], &mut rng)?.block;
    let lengths = [4, 2, 3];
    let inputs = batch(INPUT, &random_rows(&mut rng, INPUT, &lengths))?;
    let run = block.run(&inputs)?;
    let expected = run.outputs().to_rows()?;

    let mut state = block.start_state();
    for t in 0..4 {
        let (present, input) = inputs.timestep(t)?;
        let step = block.step_lanes(&state, &present, &input)?;
        let actual = step.output.to_vec2::<f64>()?;
        assert_eq!(actual.len(), present.len());
        for (row, lane) in present.iter().enumerate() {
            for (a, b) in actual[row].iter().zip(&expected[*lane][t]) {
                assert!((a - b).abs() < 1e-12, "lane {lane} step {t}: {a} vs {b}");
            }
        }
        state = step.state;
    }

    let BlockState::Running(running) = state else {
        panic!("block should be running");
    };
    assert_eq!(running.lanes, vec![0]);
    assert!(running.retain(&[1]).is_err());
    let input = Tensor::zeros((2, INPUT), DType::F64, &Device::Cpu)?;
    assert!(block.step(&BlockState::Running(running), &input).is_err());
    Ok(())
}

#[test]
fn lanes_evolve_independently() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(5);
    let attentor = attentor(QUERY, ENCODED, 4)?;
    let encoded = batch(ENCODED, &random_rows(&mut rng, ENCODED, &[2, 4, 3]))?;
    let decoder: Arc<dyn Decoder> = Arc::new(TanhCell::new(ENCODED + INPUT, STATE, QUERY + VISIBLE)?);
    let query = start_query()?;

    let (resources, _) = bound_resources(&attentor, &encoded, &Config::default())?;
    let block = InterfacerBlock::new(
        resources,
        decoder.clone(),
        InputMixing::Concat,
        StartQuery::Learned(query.clone()),
    )?;
    let rows = random_rows(&mut rng, INPUT, &[5, 2, 3]);
    let together = block.run(&batch(INPUT, &rows)?)?;
    assert_eq!(together.outputs().lengths(), &[5, 2, 3]);

    for lane in 0..3 {
        let single = batch(ENCODED, &[encoded.to_rows()?[lane].clone()])?;
        let (resources, _) = bound_resources(&attentor, &single, &Config::default())?;
        let alone = InterfacerBlock::new(
            resources,
            decoder.clone(),
            InputMixing::Concat,
            StartQuery::Learned(query.clone()),
        )?
        .run(&batch(INPUT, &[rows[lane].clone()])?)?;
        let expected = alone.outputs().to_rows()?;
        let actual = together.outputs().to_rows()?;
        for (a, b) in flat_rows(&actual[lane]).iter().zip(flat_rows(&expected[0])) {
            assert!((a - b).abs() < 1e-12, "lane {lane}: {a} vs {b}");
        }
    }
    Ok(())
}

fn flat_rows(rows: &[Vec<f64>]) -> Vec<f64> {
    rows.iter().flatten().copied().collect()
}

#[test]
fn first_step_requires_matching_lane_count() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let block = concat_block(&[2, 2], &mut rng)?.block;
    let input = Tensor::zeros((3, INPUT), DType::F64, &Device::Cpu)?;
    let err = block
        .step(&BlockState::Initial, &input)
        .expect_err("three rows against two resources");
    assert!(matches!(
        err,
        AttentionError::LaneCountMismatch {
            expected: 2,
            actual: 3
        }
    ));
    assert!(err.is_contract_violation());

    let inputs = batch(INPUT, &random_rows(&mut rng, INPUT, &[1, 1, 1]))?;
    assert!(block.run(&inputs).is_err());
    Ok(())
}

#[test]
fn empty_lanes_are_rejected() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(4);
    let block = concat_block(&[2, 2], &mut rng)?.block;
    let inputs = batch(INPUT, &random_rows(&mut rng, INPUT, &[3, 0]))?;
    let err = block.run(&inputs).expect_err("zero-length lane");
    assert!(matches!(err, AttentionError::EmptyLane { lane: 1, .. }));
    Ok(())
}

#[test]
fn backward_matches_finite_differences() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(2024);
    let fixture = concat_block(&[3, 1, 4], &mut rng)?;
    let block = &fixture.block;
    let lengths = [4, 2, 3];
    let rows = random_rows(&mut rng, INPUT, &lengths);
    let inputs = batch(INPUT, &rows)?;
    let weights = random_rows(&mut rng, VISIBLE, &lengths);

    let mut params = fixture.encoded.clone();
    params.extend(block.decoder().parameters());
    params.push(fixture.query.clone());
    params.extend(fixture.attentor.parameters());

    let run = block.run(&inputs)?;
    let pooled = run
        .records()
        .iter()
        .map(|record| record.query.as_tensor().clone())
        .collect::<Vec<_>>();
    let mut grads = Gradients::watching(&params);
    let upstream = batch(VISIBLE, &weights)?;
    let block_grads = run.backward(&upstream, &mut grads)?;
    for tensor in &pooled {
        assert!(grads.get(tensor).is_none());
    }

    let mut loss = || -> Result<f64> { weighted_loss(block.run(&inputs)?.outputs(), &weights) };
    for (index, var) in params.iter().enumerate() {
        let analytic = match grads.get(var.as_tensor()) {
            Some(grad) => flat(grad)?,
            None => vec![0.0; var.elem_count()],
        };
        for _ in 0..2 {
            let entry = rng.gen_range(0..var.elem_count());
            let numeric = numeric_grad(var, entry, 1e-6, &mut loss)?;
            assert_close(analytic[entry], numeric, &format!("param {index}[{entry}]"));
        }
    }

    // input gradients
    for (lane, len) in lengths.iter().enumerate() {
        let analytic = block_grads.inputs.to_rows()?;
        let t = rng.gen_range(0..*len);
        let k = rng.gen_range(0..INPUT);
        let eps = 1e-6;
        let mut shifted = rows.clone();
        shifted[lane][t][k] += eps;
        let plus = weighted_loss(block.run(&batch(INPUT, &shifted)?)?.outputs(), &weights)?;
        shifted[lane][t][k] -= 2.0 * eps;
        let minus = weighted_loss(block.run(&batch(INPUT, &shifted)?)?.outputs(), &weights)?;
        assert_close(
            analytic[lane][t][k],
            (plus - minus) / (2.0 * eps),
            &format!("input {lane}[{t}][{k}]"),
        );
    }
    Ok(())
}

#[test]
fn zero_start_query_reports_its_gradient() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(8);
    let attentor = attentor(QUERY, ENCODED, 3)?;
    let encoded = batch(ENCODED, &random_rows(&mut rng, ENCODED, &[2]))?;
    let (resources, _) = bound_resources(&attentor, &encoded, &Config::default())?;
    let combiner = Arc::new(Combiner::new(
        CombinerConfig::new(ENCODED, INPUT, 3, 5),
        &LinearInit::XavierUniform,
        &Device::Cpu,
        DType::F64,
    )?);
    let decoder: Arc<dyn Decoder> = Arc::new(TanhCell::new(5, STATE, QUERY + VISIBLE)?);
    let block = InterfacerBlock::new(
        resources,
        decoder,
        InputMixing::Combine(combiner.clone()),
        StartQuery::Zeros,
    )?;
    let inputs = batch(INPUT, &random_rows(&mut rng, INPUT, &[3]))?;
    let run = block.run(&inputs)?;
    let upstream = batch(VISIBLE, &random_rows(&mut rng, VISIBLE, &[3]))?;
    let mut grads = Gradients::watching(&combiner.parameters());
    let out = run.backward(&upstream, &mut grads)?;
    assert_eq!(out.start_query.dims(), &[QUERY]);
    assert_eq!(out.start_state.dims(), &[STATE]);
    assert_eq!(grads.len(), combiner.parameters().len());
    Ok(())
}
