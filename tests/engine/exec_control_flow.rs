use std::collections::HashMap;

use anyhow::Result;
use infergraph::{DType, ExecError, Graph, OpKind, Session, Tensor, TensorData};

use crate::common::{self, MathDispatcher};

fn binds(pairs: &[(&str, Tensor)]) -> HashMap<String, Tensor> {
    pairs
        .iter()
        .map(|(name, tensor)| ((*name).to_string(), tensor.clone()))
        .collect()
}

fn conditional_graph() -> Result<Graph> {
    // y = pred ? x * 2 : x + 2
    Graph::builder()
        .placeholder("x", DType::F32)
        .placeholder("pred", DType::Bool)
        .constant("two", Tensor::scalar_f32(2.0))
        .op("sw", OpKind::Switch, &["x", "pred"], &["x_f", "x_t"])
        .op("add.f", OpKind::Plain, &["x_f", "two"], &["y_f"])
        .op("mul.t", OpKind::Plain, &["x_t", "two"], &["y_t"])
        .op("m", OpKind::Merge, &["y_f", "y_t"], &["y"])
        .build()
}

#[test]
fn switch_routes_to_the_true_branch() -> Result<()> {
    let graph = conditional_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(
        &["y"],
        binds(&[
            ("x", Tensor::scalar_f32(4.0)),
            ("pred", Tensor::scalar_bool(true)),
        ]),
    )?;
    assert_eq!(common::scalar_f32_of(&outputs["y"])?, 8.0);
    // Only the taken branch ran.
    assert_eq!(session.memory_stats().allocations, 1);
    Ok(())
}

#[test]
fn switch_routes_to_the_false_branch() -> Result<()> {
    let graph = conditional_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(
        &["y"],
        binds(&[
            ("x", Tensor::scalar_f32(4.0)),
            ("pred", Tensor::scalar_bool(false)),
        ]),
    )?;
    assert_eq!(common::scalar_f32_of(&outputs["y"])?, 6.0);
    Ok(())
}

#[test]
fn switch_predicate_must_be_scalar_bool() -> Result<()> {
    let graph = conditional_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    let err = session
        .run(
            &["y"],
            binds(&[
                ("x", Tensor::scalar_f32(4.0)),
                ("pred", Tensor::new(TensorData::Bool(vec![true, false]), vec![2])?),
            ]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("type mismatch"));
    Ok(())
}

#[test]
fn identity_forwards_the_same_buffer() -> Result<()> {
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .op("idn", OpKind::Identity, &["x"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["y"], binds(&[("x", Tensor::from_f32(vec![1.0, 2.0]))]))?;
    assert_eq!(common::vec_f32_of(&outputs["y"])?, vec![1.0, 2.0]);

    // Zero-copy forward: no buffer was allocated or reclaimed.
    let stats = session.memory_stats();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.releases, 0);
    Ok(())
}

#[test]
fn identity_alias_gates_its_source_release() -> Result<()> {
    // k aliases h, so h drains only once k's last consumer has run.
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .constant("one", Tensor::scalar_f32(1.0))
        .op("add.h", OpKind::Plain, &["x", "one"], &["h"])
        .op("idn", OpKind::Identity, &["h"], &["k"])
        .op("add.y", OpKind::Plain, &["k", "one"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["y"], binds(&[("x", Tensor::scalar_f32(1.0))]))?;
    assert_eq!(common::scalar_f32_of(&outputs["y"])?, 3.0);

    let stats = session.memory_stats();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.releases, 1);
    let released = session.released_arrays();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].name, "h");
    Ok(())
}

#[test]
fn merge_with_no_bindable_input_fails_with_missing_value() -> Result<()> {
    // Both merge inputs hang off the untaken switch branch, so neither is
    // ever bound and the requested output cannot be produced.
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .constant("pred", Tensor::scalar_bool(false))
        .constant("one", Tensor::scalar_f32(1.0))
        .op("sw", OpKind::Switch, &["x", "pred"], &["x_f", "x_t"])
        .op("add.a", OpKind::Plain, &["x_t", "one"], &["v1"])
        .op("mul.b", OpKind::Plain, &["x_t", "one"], &["v2"])
        .op("m", OpKind::Merge, &["v1", "v2"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let err = session
        .run(&["y"], binds(&[("x", Tensor::scalar_f32(4.0))]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExecError>(),
        Some(ExecError::MissingValue(_))
    ));
    Ok(())
}

#[test]
fn exit_at_the_root_frame_fails() -> Result<()> {
    let graph = Graph::builder()
        .placeholder("x", DType::F32)
        .op("ex", OpKind::Exit, &["x"], &["out"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let err = session
        .run(&["out"], binds(&[("x", Tensor::scalar_f32(1.0))]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExecError>(),
        Some(ExecError::FrameIterationError(_))
    ));
    Ok(())
}

/// `while (i < limit) { s += i; i += 1 }` with both loop variables carried
/// through Merge/Switch/NextIteration and closed by their own Exit ops.
fn while_loop_graph() -> Result<Graph> {
    Graph::builder()
        .constant("zero", Tensor::scalar_f32(0.0))
        .constant("limit", Tensor::scalar_f32(3.0))
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
            "enter_one",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: true,
            },
            &["one"],
            &["one_e"],
        )
        .op("merge_i", OpKind::Merge, &["i_e", "i_n"], &["i"])
        .op("merge_s", OpKind::Merge, &["s_e", "s_n"], &["s"])
        .op("less.c", OpKind::Plain, &["i", "limit_e"], &["c_raw"])
        .op("lc", OpKind::LoopCond, &["c_raw"], &["c"])
        .op("sw_i", OpKind::Switch, &["i", "c"], &["i_exit", "i_body"])
        .op("sw_s", OpKind::Switch, &["s", "c"], &["s_exit", "s_body"])
        .op("add.i", OpKind::Plain, &["i_body", "one_e"], &["i_next_val"])
        .op("add.s", OpKind::Plain, &["s_body", "i_body"], &["s_next_val"])
        .op("ni", OpKind::NextIteration, &["i_next_val"], &["i_n"])
        .op("ns", OpKind::NextIteration, &["s_next_val"], &["s_n"])
        .op("ex_i", OpKind::Exit, &["i_exit"], &["i_out"])
        .op("ex_s", OpKind::Exit, &["s_exit"], &["s_out"])
        .build()
}

#[test]
fn while_loop_runs_three_iterations() -> Result<()> {
    let graph = while_loop_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["i_out", "s_out"], HashMap::new())?;

    assert_eq!(common::scalar_f32_of(&outputs["i_out"])?, 3.0);
    // s accumulates 0 + 1 + 2.
    assert_eq!(common::scalar_f32_of(&outputs["s_out"])?, 3.0);

    // Four condition evaluations plus three body executions per loop var,
    // all fresh in later iterations so past values stay addressable.
    let stats = session.memory_stats();
    assert_eq!(stats.allocations, 10);
    assert_eq!(stats.reuses, 0);
    Ok(())
}

#[test]
fn loop_intermediates_are_released_but_outputs_survive() -> Result<()> {
    let graph = while_loop_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    session.run(&["i_out", "s_out"], HashMap::new())?;

    let released = session.released_arrays();
    assert!(!released.is_empty());
    for id in released {
        assert_ne!(id.name, "i_out");
        assert_ne!(id.name, "s_out");
        assert_ne!(id.name, "zero");
        assert_ne!(id.name, "one");
        assert_ne!(id.name, "limit");
    }
    // Iteration 0 and 1 body values drain; the final iteration's values are
    // part of the requested outputs' alias groups and survive.
    let body_releases = released
        .iter()
        .filter(|id| id.name == "i_next_val" || id.name == "s_next_val")
        .count();
    assert_eq!(body_releases, 4);
    Ok(())
}

#[test]
fn merge_prefers_the_first_declared_input() -> Result<()> {
    // Outside loops both inputs can be bound; resolution is pinned to
    // declaration order, never arrival order.
    let graph = Graph::builder()
        .placeholder("a", DType::F32)
        .placeholder("b", DType::F32)
        .op("m", OpKind::Merge, &["a", "b"], &["y"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(
        &["y"],
        binds(&[
            ("a", Tensor::scalar_f32(1.0)),
            ("b", Tensor::scalar_f32(2.0)),
        ]),
    )?;
    assert_eq!(common::scalar_f32_of(&outputs["y"])?, 1.0);
    Ok(())
}

#[test]
fn every_iteration_value_is_released_after_exit_is_consumed() -> Result<()> {
    // Single loop variable, with the exit value feeding a root-frame op so
    // nothing in the loop belongs to a requested alias group.
    let graph = Graph::builder()
        .constant("zero", Tensor::scalar_f32(0.0))
        .constant("limit", Tensor::scalar_f32(3.0))
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
            "enter_limit",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: true,
            },
            &["limit"],
            &["limit_e"],
        )
        .op(
            "enter_one",
            OpKind::Enter {
                frame: "loop".to_string(),
                is_constant: true,
            },
            &["one"],
            &["one_e"],
        )
        .op("merge_i", OpKind::Merge, &["i_e", "i_n"], &["i"])
        .op("less.c", OpKind::Plain, &["i", "limit_e"], &["c_raw"])
        .op("lc", OpKind::LoopCond, &["c_raw"], &["c"])
        .op("sw_i", OpKind::Switch, &["i", "c"], &["i_exit", "i_body"])
        .op("add.i", OpKind::Plain, &["i_body", "one_e"], &["i_next_val"])
        .op("ni", OpKind::NextIteration, &["i_next_val"], &["i_n"])
        .op("ex_i", OpKind::Exit, &["i_exit"], &["i_out"])
        .op("add.fin", OpKind::Plain, &["i_out", "one"], &["fin"])
        .build()?;

    let mut session = Session::new(&graph, MathDispatcher);
    let outputs = session.run(&["fin"], HashMap::new())?;
    assert_eq!(common::scalar_f32_of(&outputs["fin"])?, 4.0);

    // Three distinct per-iteration body values existed and all drained once
    // the exit value's last consumer ran.
    let body: Vec<u64> = session
        .released_arrays()
        .iter()
        .filter(|id| id.name == "i_next_val")
        .map(|id| id.frame_iter.iteration)
        .collect();
    let mut iterations = body.clone();
    iterations.sort_unstable();
    assert_eq!(iterations, vec![0, 1, 2]);
    Ok(())
}

#[test]
fn while_loop_replays_identically() -> Result<()> {
    let graph = while_loop_graph()?;
    let mut session = Session::new(&graph, MathDispatcher);
    let first = session.run(&["s_out"], HashMap::new())?;
    let first_stats = session.memory_stats();
    let second = session.run(&["s_out"], HashMap::new())?;

    assert_eq!(first["s_out"], second["s_out"]);
    assert_eq!(first_stats, session.memory_stats());
    Ok(())
}
