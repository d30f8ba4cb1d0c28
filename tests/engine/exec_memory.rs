use std::collections::HashMap;

use anyhow::Result;
use infergraph::{DType, Graph, OpKind, Session, Tensor};

use crate::common::{self, MathDispatcher};

fn binds(pairs: &[(&str, Tensor)]) -> HashMap<String, Tensor> {
    pairs
        .iter()
        .map(|(name, tensor)| ((*name).to_string(), tensor.clone()))
        .collect()
}

#[test]
fn requested_alias_of_a_placeholder_is_never_released() -> Result<()> {
    // The switch output is a zero-copy alias of the placeholder; requesting
    // it must keep the whole alias group alive.
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .constant("pred", Tensor::scalar_bool(true))
        .op("sw", OpKind::Switch, &["x", "pred"], &["f", "t"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["t"], binds(&[("x", Tensor::from_f32(vec![1.0, 2.0]))]))?;
    assert_eq!(common::vec_f32_of(&outputs["t"])?, vec![1.0, 2.0]);

    let stats = session.memory_stats();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.releases, 0);
    assert!(session.released_arrays().is_empty());
    Ok(())
}

#[test]
fn shared_intermediate_is_released_exactly_once() -> Result<()> {
    // h feeds two consumers; its buffer must drain only after both ran.
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .constant("one", Tensor::scalar_f32(1.0))
        .op("add.h", OpKind::Plain, &["x", "one"], &["h"])
        .op("add.a", OpKind::Plain, &["h", "one"], &["a"])
        .op("mul.b", OpKind::Plain, &["h", "h"], &["b"])
        .op("add.y", OpKind::Plain, &["a", "b"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["y"], binds(&[("x", Tensor::scalar_f32(2.0))]))?;
    // h = 3, a = 4, b = 9, y = 13.
    assert_eq!(common::scalar_f32_of(&outputs["y"])?, 13.0);

    let released = session.released_arrays();
    let h_releases = released.iter().filter(|id| id.name == "h").count();
    assert_eq!(h_releases, 1);
    assert_eq!(session.memory_stats().releases, 3);
    Ok(())
}

#[test]
fn release_log_resets_between_runs() -> Result<()> {
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .constant("one", Tensor::scalar_f32(1.0))
        .op("add.h", OpKind::Plain, &["x", "one"], &["h"])
        .op("add.y", OpKind::Plain, &["h", "one"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    session.run(&["y"], binds(&[("x", Tensor::scalar_f32(0.0))]))?;
    let first = session.released_arrays().to_vec();
    session.run(&["y"], binds(&[("x", Tensor::scalar_f32(0.0))]))?;

    assert_eq!(first, session.released_arrays());
    assert_eq!(first.len(), 1);
    Ok(())
}

#[test]
fn released_buffers_are_reused_across_frame_activations() -> Result<()> {
    // An inner one-shot frame inside a two-iteration outer loop. The inner
    // body value drains within each outer iteration, so the second
    // activation of add.t finds its slot buffer free and takes it over
    // (iteration 0 of the inner frame is outside the always-fresh rule).
    let graph = Graph::builder()
        .constant("zero", Tensor::scalar_f32(0.0))
        .constant("limit", Tensor::scalar_f32(2.0))
        .constant("one", Tensor::scalar_f32(1.0))
        .op(
            "enter_i",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: false,
            },
            &["zero"],
            &["i_e"],
        )
        .op(
            "enter_s",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: false,
            },
            &["zero"],
            &["s_e"],
        )
        .op(
            "enter_limit",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: true,
            },
            &["limit"],
            &["limit_e"],
        )
        .op(
            "enter_one_l",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: true,
            },
            &["one"],
            &["one_l"],
        )
        .op("merge_i", OpKind::Merge, &["i_e", "i_n"], &["i"])
        .op("merge_s", OpKind::Merge, &["s_e", "s_n"], &["s"])
        .op("less.c", OpKind::Plain, &["i", "limit_e"], &["c_raw"])
        .op("lc", OpKind::LoopCond, &["c_raw"], &["c"])
        .op("sw_i", OpKind::Switch, &["i", "c"], &["i_exit", "i_body"])
        .op("sw_s", OpKind::Switch, &["s", "c"], &["s_exit", "s_body"])
        .op(
            "enter_b",
            OpKind::Enter {
                frame: "inner".to_string(),
                is_constant: false,
            },
            &["i_body"],
            &["i_b_e"],
        )
        .op(
            "enter_one_in",
            OpKind::Enter {
                frame: "inner".to_string(),
                is_constant: true,
            },
            &["one_l"],
            &["one_in"],
        )
        .op("add.t", OpKind::Plain, &["i_b_e", "one_in"], &["t"])
        .op("ex_t", OpKind::Exit, &["t"], &["t_out"])
        .op("add.i", OpKind::Plain, &["i_body", "one_l"], &["i_next_val"])
        .op("add.s", OpKind::Plain, &["s_body", "t_out"], &["s_next_val"])
        .op("ni", OpKind::NextIteration, &["i_next_val"], &["i_n"])
        .op("ns", OpKind::NextIteration, &["s_next_val"], &["s_n"])
        .op("ex_i", OpKind::Exit, &["i_exit"], &["i_out"])
        .op("ex_s", OpKind::Exit, &["s_exit"], &["s_out"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["s_out"], HashMap::new())?;
    // s accumulates (0 + 1) + (1 + 1) over two iterations.
    assert_eq!(common::scalar_f32_of(&outputs["s_out"])?, 3.0);

    let stats = session.memory_stats();
    assert_eq!(stats.reuses, 1);
    // Three condition values, two body values per loop var, one fresh inner
    // value; the second inner value rides the reused buffer.
    assert_eq!(stats.allocations, 8);
    Ok(())
}

#[test]
fn merge_keeps_its_winning_input_alive() -> Result<()> {
    // The merge output aliases the winning branch value, so requesting the
    // merge output must keep that plain-op buffer from being reclaimed.
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .placeholder("pred", DType::Bool)
        .constant("two", Tensor::scalar_f32(2.0))
        .op("sw", OpKind::Switch, &["x", "pred"], &["x_f", "x_t"])
        .op("add.f", OpKind::Plain, &["x_f", "two"], &["y_f"])
        .op("mul.t", OpKind::Plain, &["x_t", "two"], &["y_t"])
        .op("m", OpKind::Merge, &["y_f", "y_t"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    session.run(
        &["y"],
        binds(&[
            ("x", Tensor::scalar_f32(4.0)),
            ("pred", Tensor::scalar_bool(true)),
        ]),
    )?;
    assert!(session
        .released_arrays()
        .iter()
        .all(|id| id.name != "y_t" && id.name != "y"));
    Ok(())
}
