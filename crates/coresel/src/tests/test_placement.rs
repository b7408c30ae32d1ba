use crate::common::Bitmap;
use crate::engine::{AllocAction, SwitchRecord};
use crate::job::JobMap;
use crate::node::NodeReq;
use crate::placement::{JobRequest, SelectMode};
use crate::tests::utils::{all_nodes, engine, insert, JobBuilder};
use crate::{PartitionId, SelectError};

fn request() -> JobRequest {
    JobRequest::new(PartitionId::new(0))
}

#[test]
fn test_place_on_lowest_node_and_core() {
    let engine = engine(&[2, 2], 2);
    let jobs = JobMap::default();
    let mut req = request();
    req.min_cpus = 2;

    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[0]));
    let res = &placement.resources;
    assert_eq!(res.cpus, vec![2]);
    assert_eq!(res.ncpus, 2);
    // lowest cores of node 0
    assert!(res.core_bitmap.test(0) && res.core_bitmap.test(1));
    assert!(placement.preemptees.is_empty());
}

#[test]
fn test_occupied_cores_move_selection_to_next_node() {
    let mut engine = engine(&[2, 2], 1);
    let mut jobs = JobMap::default();
    let a = insert(&mut jobs, JobBuilder::new(1).on(0, &[0, 1]).build(&engine));
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 2;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[1]));
}

#[test]
fn test_second_row_allows_oversubscription() {
    let mut engine = engine(&[2], 2);
    let mut jobs = JobMap::default();
    let a = insert(&mut jobs, JobBuilder::new(1).on(0, &[0, 1]).build(&engine));
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    // the node is full in row 0, but row 1 is open
    let mut req = request();
    req.min_cpus = 2;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(1, &[0]));
}

#[test]
fn test_test_only_ignores_occupancy() {
    let mut engine = engine(&[2], 1);
    let mut jobs = JobMap::default();
    let a = insert(&mut jobs, JobBuilder::new(1).on(0, &[0, 1]).build(&engine));
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 2;
    assert!(matches!(
        engine.job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None),
        Err(SelectError::NoFit)
    ));
    // the job could run on the configured capacity once the node drains
    engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::TestOnly, &[], None)
        .unwrap();
}

#[test]
fn test_required_nodes_are_selected_first() {
    let engine = engine(&[2, 2, 2], 1);
    let jobs = JobMap::default();
    let mut req = request();
    req.min_cpus = 2;
    req.min_nodes = 1;
    req.required_nodes = Some(Bitmap::from_indices(3, &[2]));

    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert!(placement.nodes.test(2));
}

#[test]
fn test_exclude_cores_are_not_allocated() {
    let engine = engine(&[2, 2], 1);
    let jobs = JobMap::default();
    let mut excl = Bitmap::zeros(engine.core_map().total_cores());
    excl.set(0);
    excl.set(1); // all of node 0

    let mut req = request();
    req.min_cpus = 2;
    let placement = engine
        .job_test(
            &jobs,
            &req,
            &all_nodes(&engine),
            SelectMode::RunNow,
            &[],
            Some(&excl),
        )
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[1]));
}

#[test]
fn test_exclusive_request_avoids_used_nodes() {
    let mut engine = engine(&[2, 2], 2);
    let mut jobs = JobMap::default();
    let a = insert(
        &mut jobs,
        JobBuilder::new(1)
            .on(0, &[0])
            .node_req(NodeReq::OneRow)
            .build(&engine),
    );
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 2;
    req.node_req = NodeReq::Exclusive;
    req.whole_node = true;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[1]));
    // a whole-node allocation covers every core of the node
    assert_eq!(placement.resources.core_bitmap.set_count(), 2);
}

#[test]
fn test_exclusive_node_blocks_everyone() {
    let mut engine = engine(&[2, 2], 2);
    let mut jobs = JobMap::default();
    let a = insert(
        &mut jobs,
        JobBuilder::new(1)
            .on(0, &[0])
            .node_req(NodeReq::Exclusive)
            .build(&engine),
    );
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 1;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    // node 0 is held exclusively even though row 1 shows free cores there
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[1]));
}

#[test]
fn test_memory_shortfall_drops_node() {
    let mut engine = engine(&[2, 2], 1);
    let mut jobs = JobMap::default();
    let a = insert(
        &mut jobs,
        JobBuilder::new(1)
            .on_mem(0, &[0], crate::tests::utils::TEST_NODE_MEMORY)
            .build(&engine),
    );
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 1;
    req.pn_min_memory = 100;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(2, &[1]));
    assert_eq!(placement.resources.memory_allocated, vec![100]);
}

#[test]
fn test_will_run_reports_needed_preemptees() {
    let mut engine = engine(&[2], 1);
    let mut jobs = JobMap::default();
    let a = insert(
        &mut jobs,
        JobBuilder::new(1).on(0, &[0, 1]).end_time(42).build(&engine),
    );
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_cpus = 2;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::WillRun, &[a], None)
        .unwrap();
    assert_eq!(placement.preemptees, vec![a]);
    assert_eq!(placement.start_hint, Some(42));
}

#[test]
fn test_will_run_without_preemption_has_no_hint() {
    let engine = engine(&[2], 1);
    let jobs = JobMap::default();
    let mut req = request();
    req.min_cpus = 1;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::WillRun, &[], None)
        .unwrap();
    assert!(placement.preemptees.is_empty());
    assert_eq!(placement.start_hint, None);
}

#[test]
fn test_contiguous_takes_an_adjacent_run() {
    let mut engine = engine(&[2, 2, 2, 2], 1);
    let mut jobs = JobMap::default();
    // occupy node 1 fully so the first adjacent pair is n2,n3
    let a = insert(&mut jobs, JobBuilder::new(1).on(1, &[0, 1]).build(&engine));
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_nodes = 2;
    req.req_nodes = 2;
    req.min_cpus = 4;
    req.contiguous = true;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    assert_eq!(placement.nodes, Bitmap::from_indices(4, &[2, 3]));
}

#[test]
fn test_topology_prefers_single_leaf() {
    let mut engine = engine(&[2, 2, 2, 2], 1);
    engine
        .set_switch_table(vec![
            SwitchRecord {
                name: "leaf0".to_string(),
                level: 0,
                node_bitmap: Bitmap::from_indices(4, &[0, 1]),
            },
            SwitchRecord {
                name: "leaf1".to_string(),
                level: 0,
                node_bitmap: Bitmap::from_indices(4, &[2, 3]),
            },
            SwitchRecord {
                name: "root".to_string(),
                level: 1,
                node_bitmap: Bitmap::from_indices(4, &[0, 1, 2, 3]),
            },
        ])
        .unwrap();
    let mut jobs = JobMap::default();
    // leaf0 can only offer one free node
    let a = insert(&mut jobs, JobBuilder::new(1).on(0, &[0, 1]).build(&engine));
    engine.add_job_to_res(&mut jobs, a, AllocAction::Normal).unwrap();

    let mut req = request();
    req.min_nodes = 2;
    req.req_nodes = 2;
    req.min_cpus = 4;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    // leaf1 holds the allocation whole; nodes 1+2 would straddle switches
    assert_eq!(placement.nodes, Bitmap::from_indices(4, &[2, 3]));
}

#[test]
fn test_smt_scaling_reports_thread_cpus() {
    let mut nodes = crate::tests::utils::cluster(&[2]);
    nodes[0].cpus = 4;
    nodes[0].threads = 2;
    let mut engine = crate::engine::SelectEngine::new(
        Box::new(crate::policy::CoreSelector),
        Box::new(crate::devices::NullDevices),
    );
    engine
        .node_init(
            nodes,
            &[crate::engine::PartitionConfig {
                id: PartitionId::new(0),
                num_rows: 1,
            }],
        )
        .unwrap();

    let jobs = JobMap::default();
    let mut req = request();
    req.min_cpus = 4;
    let placement = engine
        .job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None)
        .unwrap();
    // 2 cores carry 4 hardware threads
    assert_eq!(placement.resources.cpus, vec![4]);
    assert_eq!(placement.resources.core_bitmap.set_count(), 2);
    assert!(placement.resources.core_bitmap.set_count() * 2 >= 4);
}

#[test]
fn test_max_nodes_bounds_selection() {
    let engine = engine(&[1, 1, 1, 1], 1);
    let jobs = JobMap::default();
    let mut req = request();
    req.min_cpus = 4;
    req.max_nodes = 2;
    assert!(matches!(
        engine.job_test(&jobs, &req, &all_nodes(&engine), SelectMode::RunNow, &[], None),
        Err(SelectError::NoFit)
    ));
}
