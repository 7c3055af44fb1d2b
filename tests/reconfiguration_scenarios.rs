//! End-to-end reconfiguration scenarios driven through the public protocol
//! surface: open a local replica, feed it the manager/peer/proxy messages a
//! real exchange would produce, and check the actions it emits.

use reconfig_core::{
    ActionQueue, DoReconfigurationMessageBody, Epoch, ErrorCode, ExecutionContext, FailoverUnit,
    FailoverUnitDescription, FailoverUnitId, FmMessage, HostingAdapter, NodeId, NodeInstance,
    PeerMessage, ProxyMessage, ProxyReplyMessageBody, ReconfigResult, ReconfigurationConfig,
    ReconfigurationResult, ReconfigurationStage, ReplicaDeactivationInfo, ReplicaDescription,
    ReplicaMessageBody, ReplicaReplyMessageBody, ReplicaRole, ServiceDescription,
    ServiceTypeRegistration, StateMachineAction, UpdateConfigurationReason, INVALID_LSN,
};

const LOCAL_NODE: NodeInstance = NodeInstance {
    id: NodeId(1),
    instance: 1,
};

struct StubHosting;

impl HostingAdapter for StubHosting {
    fn find_service_type_registration(
        &mut self,
        service_type: &str,
    ) -> ReconfigResult<ServiceTypeRegistration> {
        Ok(ServiceTypeRegistration {
            service_type: service_type.to_string(),
            host_id: "host-1".into(),
            runtime_id: "rt-1".into(),
        })
    }

    fn on_registration_released(&mut self, _registration: &ServiceTypeRegistration) {}
}

struct Harness {
    now: chrono::DateTime<chrono::Utc>,
    config: ReconfigurationConfig,
    hosting: StubHosting,
}

impl Harness {
    fn new() -> Self {
        Self {
            now: chrono::Utc::now(),
            config: ReconfigurationConfig::default(),
            hosting: StubHosting,
        }
    }

    fn advance(&mut self, duration: std::time::Duration) {
        self.now += chrono::Duration::from_std(duration).unwrap();
    }

    fn call<R>(
        &mut self,
        f: impl FnOnce(&mut ExecutionContext<'_>) -> R,
    ) -> Vec<StateMachineAction> {
        let mut queue = ActionQueue::new();
        let mut context = ExecutionContext::new(
            self.now,
            &self.config,
            LOCAL_NODE,
            &mut queue,
            &mut self.hosting,
        );
        f(&mut context);
        queue.drain()
    }
}

fn service() -> ServiceDescription {
    ServiceDescription::new("fabric:/test/svc", "Echo", 3, 2, true)
}

/// Opens a fresh unit hosting the local replica (id 1) in `role`.
fn open_local_replica(harness: &mut Harness, role: ReplicaRole) -> FailoverUnit {
    let mut unit = FailoverUnit::new(FailoverUnitId::new_random(), service());

    let mut desc = ReplicaDescription::new(LOCAL_NODE, 1, 1);
    desc.current_configuration_role = role;
    let create = ReplicaMessageBody {
        fu_desc: FailoverUnitDescription::new(unit.id(), Epoch::new(1, 0)),
        replica: desc,
        service_desc: service(),
    };
    let actions = harness.call(|ctx| unit.process_create_local_replica(&create, ctx));
    assert!(actions
        .iter()
        .any(|a| matches!(a, StateMachineAction::SendToProxy(ProxyMessage::ReplicaOpen(_)))));

    let mut opened = ReplicaDescription::new(LOCAL_NODE, 1, 1);
    opened.service_location = "svc-loc-1".into();
    opened.replication_endpoint = "repl-1".into();
    opened.last_acknowledged_lsn = 0;
    let reply = ProxyReplyMessageBody {
        fu_desc: *unit.description(),
        local_replica: opened,
        error_code: ErrorCode::Success,
    };
    harness.call(|ctx| unit.process_replica_open_reply(&reply, ctx));

    assert!(unit.is_local_replica_open());
    unit
}

fn remote_desc(id: i64, pc: ReplicaRole, cc: ReplicaRole) -> ReplicaDescription {
    let mut desc = ReplicaDescription::new(NodeInstance::new(id as u64, 1), id, id);
    desc.previous_configuration_role = pc;
    desc.current_configuration_role = cc;
    desc
}

fn local_desc(pc: ReplicaRole, cc: ReplicaRole) -> ReplicaDescription {
    let mut desc = ReplicaDescription::new(LOCAL_NODE, 1, 1);
    desc.previous_configuration_role = pc;
    desc.current_configuration_role = cc;
    desc
}

fn reconfiguration_body(
    unit: &FailoverUnit,
    pc_epoch: Epoch,
    cc_epoch: Epoch,
    replicas: Vec<ReplicaDescription>,
) -> DoReconfigurationMessageBody {
    let mut fu_desc = *unit.description();
    fu_desc.previous_configuration_epoch = pc_epoch;
    fu_desc.current_configuration_epoch = cc_epoch;
    DoReconfigurationMessageBody {
        fu_desc,
        service_desc: service(),
        replicas,
        phase0_duration: None,
    }
}

fn proxy_reply(unit: &FailoverUnit, local: ReplicaDescription) -> ProxyReplyMessageBody {
    ProxyReplyMessageBody {
        fu_desc: *unit.description(),
        local_replica: local,
        error_code: ErrorCode::Success,
    }
}

fn get_lsn_reply(
    unit: &FailoverUnit,
    mut desc: ReplicaDescription,
    first: i64,
    last: i64,
) -> ReplicaReplyMessageBody {
    desc.first_acknowledged_lsn = first;
    desc.last_acknowledged_lsn = last;
    desc.deactivation_info = Some(ReplicaDeactivationInfo::new(Epoch::new(1, 0), 0));
    ReplicaReplyMessageBody {
        fu_desc: *unit.description(),
        replica: desc,
        error_code: ErrorCode::Success,
    }
}

#[test]
fn test_failover_promotion_runs_to_completion() {
    let mut harness = Harness::new();
    let mut unit = open_local_replica(&mut harness, ReplicaRole::Secondary);

    // The old primary (2) is gone from the primary slot; the manager
    // promotes this replica.
    let body = reconfiguration_body(
        &unit,
        Epoch::new(1, 0),
        Epoch::new(2, 0),
        vec![
            local_desc(ReplicaRole::Secondary, ReplicaRole::Primary),
            remote_desc(2, ReplicaRole::Primary, ReplicaRole::Secondary),
            remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        ],
    );
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase1GetLsn
    );
    let polls = actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                StateMachineAction::SendToPeer {
                    message: PeerMessage::GetLsn(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(polls, 2);

    // Everyone reports progress; this replica ties for the highest LSN and
    // wins the election.
    let status = proxy_reply(&unit, {
        let mut d = local_desc(ReplicaRole::Secondary, ReplicaRole::Primary);
        d.first_acknowledged_lsn = 2;
        d.last_acknowledged_lsn = 10;
        d
    });
    harness.call(|ctx| unit.process_replicator_get_status_reply(&status, ctx));

    let reply = get_lsn_reply(
        &unit,
        remote_desc(2, ReplicaRole::Primary, ReplicaRole::Secondary),
        2,
        10,
    );
    harness.call(|ctx| unit.process_get_lsn_reply(&reply, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase1GetLsn
    );

    let reply = get_lsn_reply(
        &unit,
        remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        2,
        8,
    );
    let actions = harness.call(|ctx| unit.process_get_lsn_reply(&reply, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase2Catchup
    );
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToProxy(ProxyMessage::UpdateConfiguration {
            reason: UpdateConfigurationReason::Catchup,
            ..
        })
    )));

    // Catchup completes; identical memberships let the deactivate phase be
    // skipped.
    let catchup = proxy_reply(&unit, {
        let mut d = local_desc(ReplicaRole::Secondary, ReplicaRole::Primary);
        d.last_acknowledged_lsn = 10;
        d
    });
    let actions = harness.call(|ctx| {
        unit.process_update_configuration_reply(UpdateConfigurationReason::Catchup, &catchup, ctx)
    });
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase4Activate
    );
    let activates = actions
        .iter()
        .filter(|a| {
            matches!(
                a,
                StateMachineAction::SendToPeer {
                    message: PeerMessage::Activate { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(activates, 2);
    assert_eq!(
        unit.deactivation_info(),
        ReplicaDeactivationInfo::new(Epoch::new(2, 0), 10)
    );

    // Retries re-derive identical messages.
    let first = harness.call(|ctx| unit.process_msg_resends(ctx));
    let second = harness.call(|ctx| unit.process_msg_resends(ctx));
    assert_eq!(first, second);

    // Both secondaries activate; the replicator gets the closing update.
    for (id, pc) in [(2i64, ReplicaRole::Primary), (3, ReplicaRole::Secondary)] {
        let reply = ReplicaReplyMessageBody {
            fu_desc: *unit.description(),
            replica: remote_desc(id, pc, ReplicaRole::Secondary),
            error_code: ErrorCode::Success,
        };
        harness.call(|ctx| unit.process_activate_reply(&reply, ctx));
    }
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase4Activate
    );

    let end = proxy_reply(&unit, local_desc(ReplicaRole::Secondary, ReplicaRole::Primary));
    let actions = harness.call(|ctx| {
        unit.process_update_configuration_reply(
            UpdateConfigurationReason::EndReconfiguration,
            &end,
            ctx,
        )
    });

    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        unit.reconfiguration_state().result(),
        ReconfigurationResult::Completed
    );
    assert_eq!(
        unit.local_replica().current_configuration_role,
        ReplicaRole::Primary
    );
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToFm(FmMessage::DoReconfigurationReply(reply))
            if reply.error_code == ErrorCode::Success
    )));
}

#[test]
fn test_election_redirects_to_replica_with_more_progress() {
    let mut harness = Harness::new();
    let mut unit = open_local_replica(&mut harness, ReplicaRole::Secondary);

    let body = reconfiguration_body(
        &unit,
        Epoch::new(1, 0),
        Epoch::new(2, 0),
        vec![
            local_desc(ReplicaRole::Secondary, ReplicaRole::Primary),
            remote_desc(2, ReplicaRole::Primary, ReplicaRole::Secondary),
            remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        ],
    );
    harness.call(|ctx| unit.process_do_reconfiguration(&body, ctx));

    let status = proxy_reply(&unit, {
        let mut d = local_desc(ReplicaRole::Secondary, ReplicaRole::Primary);
        d.first_acknowledged_lsn = 0;
        d.last_acknowledged_lsn = 5;
        d
    });
    harness.call(|ctx| unit.process_replicator_get_status_reply(&status, ctx));

    let reply = get_lsn_reply(
        &unit,
        remote_desc(2, ReplicaRole::Primary, ReplicaRole::Secondary),
        0,
        10,
    );
    harness.call(|ctx| unit.process_get_lsn_reply(&reply, ctx));
    let reply = get_lsn_reply(
        &unit,
        remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        0,
        4,
    );
    let actions = harness.call(|ctx| unit.process_get_lsn_reply(&reply, ctx));

    // Replica 2 holds more progress; the manager is told to reconfigure
    // around it instead. Only the elected replica's LSNs go out.
    let change = actions
        .iter()
        .find_map(|a| match a {
            StateMachineAction::SendToFm(FmMessage::ChangeConfiguration(body)) => {
                Some(body.clone())
            }
            _ => None,
        })
        .expect("change configuration not sent");
    for desc in &change.replicas {
        if desc.replica_id == 2 {
            assert_eq!(desc.last_acknowledged_lsn, 10);
        } else {
            assert_eq!(desc.last_acknowledged_lsn, INVALID_LSN);
        }
    }

    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        unit.reconfiguration_state().result(),
        ReconfigurationResult::ChangeConfiguration
    );
    // The rejected promotion is rolled back.
    assert_eq!(
        unit.local_replica().current_configuration_role,
        ReplicaRole::Secondary
    );

    // A retried request is answered from the retained result.
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToFm(FmMessage::ChangeConfiguration(_))
    )));
    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
}

#[test]
fn test_swap_primary_demote_and_continue() {
    let mut harness = Harness::new();
    let mut unit = open_local_replica(&mut harness, ReplicaRole::Primary);

    let body = reconfiguration_body(
        &unit,
        Epoch::new(1, 0),
        Epoch::new(2, 0),
        vec![
            local_desc(ReplicaRole::Primary, ReplicaRole::Secondary),
            remote_desc(2, ReplicaRole::Secondary, ReplicaRole::Primary),
            remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        ],
    );
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase0Demote
    );
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToProxy(ProxyMessage::UpdateConfiguration {
            reason: UpdateConfigurationReason::Catchup,
            ..
        })
    )));

    harness.advance(std::time::Duration::from_secs(3));

    // Quorum catchup done: the demote completes and the manager continues
    // the swap on the new primary, carrying the measured demote time.
    let catchup = proxy_reply(&unit, local_desc(ReplicaRole::Primary, ReplicaRole::Secondary));
    let actions = harness.call(|ctx| {
        unit.process_update_configuration_reply(UpdateConfigurationReason::Catchup, &catchup, ctx)
    });
    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        unit.reconfiguration_state().result(),
        ReconfigurationResult::DemoteCompleted
    );
    let phase0 = actions
        .iter()
        .find_map(|a| match a {
            StateMachineAction::SendToFm(FmMessage::ContinueSwapPrimary {
                phase0_duration, ..
            }) => Some(*phase0_duration),
            _ => None,
        })
        .expect("continue swap not sent");
    assert_eq!(phase0, std::time::Duration::from_secs(3));

    // The manager retries; the continue-swap is resent from the retained
    // result.
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToFm(FmMessage::ContinueSwapPrimary { .. })
    )));
    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
}

#[test]
fn test_higher_epoch_request_aborts_demote() {
    let mut harness = Harness::new();
    let mut unit = open_local_replica(&mut harness, ReplicaRole::Primary);

    let swap = reconfiguration_body(
        &unit,
        Epoch::new(1, 0),
        Epoch::new(2, 0),
        vec![
            local_desc(ReplicaRole::Primary, ReplicaRole::Secondary),
            remote_desc(2, ReplicaRole::Secondary, ReplicaRole::Primary),
            remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        ],
    );
    harness.call(|ctx| unit.process_do_reconfiguration(&swap, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase0Demote
    );

    // The designated new primary failed; the manager re-issues the
    // reconfiguration with this replica staying primary.
    let retry = reconfiguration_body(
        &unit,
        Epoch::new(2, 0),
        Epoch::new(3, 0),
        vec![
            local_desc(ReplicaRole::Primary, ReplicaRole::Primary),
            remote_desc(3, ReplicaRole::Secondary, ReplicaRole::Secondary),
        ],
    );
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&retry, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::AbortPhase0Demote
    );
    assert!(actions.iter().any(|a| matches!(
        a,
        StateMachineAction::SendToProxy(ProxyMessage::CancelCatchupReplicaSet(_))
    )));

    // The replicator cancels the catchup; this replica stays primary.
    let cancel = proxy_reply(&unit, local_desc(ReplicaRole::Primary, ReplicaRole::Secondary));
    harness.call(|ctx| unit.process_cancel_catchup_reply(&cancel, ctx));
    assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
    assert_eq!(
        unit.reconfiguration_state().result(),
        ReconfigurationResult::AbortSwapPrimary
    );
    assert_eq!(
        unit.local_replica().current_configuration_role,
        ReplicaRole::Primary
    );

    // The re-issued request now starts cleanly.
    let actions = harness.call(|ctx| unit.process_do_reconfiguration(&retry, ctx));
    assert_eq!(
        unit.reconfiguration_stage(),
        ReconfigurationStage::Phase2Catchup
    );
    assert!(!actions.is_empty());
}
