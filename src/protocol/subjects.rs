//! Subject layout. Every worker gets its own namespace with one control and
//! one data subject per direction:
//!
//! ```text
//! fleet.compute.<node>.in.ctrl    orchestrator -> worker control
//! fleet.compute.<node>.in.msgs    orchestrator -> worker data
//! fleet.compute.<node>.out.ctrl   worker -> orchestrator control
//! fleet.compute.<node>.out.msgs   worker -> orchestrator data
//! ```

const ROOT: &str = "fleet.compute";

fn subject(node_id: &str, direction: &str, kind: &str) -> String {
    format!("{ROOT}.{node_id}.{direction}.{kind}")
}

pub fn compute_in_ctrl(node_id: &str) -> String {
    subject(node_id, "in", "ctrl")
}

pub fn compute_in_msgs(node_id: &str) -> String {
    subject(node_id, "in", "msgs")
}

pub fn compute_out_ctrl(node_id: &str) -> String {
    subject(node_id, "out", "ctrl")
}

pub fn compute_out_msgs(node_id: &str) -> String {
    subject(node_id, "out", "msgs")
}

/// Control requests from every worker.
pub fn orchestrator_in_ctrl() -> String {
    subject("*", "out", "ctrl")
}

pub fn orchestrator_in_msgs(node_id: &str) -> String {
    compute_out_msgs(node_id)
}

pub fn orchestrator_out_msgs(node_id: &str) -> String {
    compute_in_msgs(node_id)
}
