use anyhow::Result;
use inflow::GraphDef;

use crate::common;

#[test]
fn graph_def_round_trips_through_json() -> Result<()> {
    let graph = common::add_mul_graph();
    let encoded = serde_json::to_string(&graph)?;
    let decoded: GraphDef = serde_json::from_str(&encoded)?;
    assert_eq!(graph, decoded);

    // A decoded graph is a valid session input.
    let session = common::new_cpu_session()?;
    session.create(decoded)?;
    let mut outputs = Vec::new();
    session.run(
        &[common::feed("a:0", 2), common::feed("b:0", 3)],
        &common::names(&["t:0"]),
        &[],
        &mut outputs,
    )?;
    assert_eq!(common::scalar_i32(&outputs[0])?, 10);
    Ok(())
}
