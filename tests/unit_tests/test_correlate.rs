use std::sync::Arc;

use chrono::{DateTime, Utc};
use sigscope_rs::{
    correlate::{
        reorder::ReorderBuffer,
        session::{Session, SessionState},
        shard::{ClaimRequest, Shard, ShardEvent},
    },
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{Direction, LinkMeta, Message, Outcome, Protocol},
    },
};

use super::{at, link, test_config};

const IMSI: &str = "234150123456789";

fn make_shard() -> Shard {
    Shard::new(0, Arc::new(test_config()), Arc::new(Dictionary::new()))
}

fn make_shard_with(tune: impl FnOnce(&mut sigscope_rs::cfg::config::Config)) -> Shard {
    let mut cfg = test_config();
    tune(&mut cfg);
    Shard::new(0, Arc::new(cfg), Arc::new(Dictionary::new()))
}

struct MsgSpec<'a> {
    protocol: Protocol,
    name: &'a str,
    direction: Direction,
    outcome: Outcome,
    ids: Vec<Identifier>,
    txn: Option<u64>,
    cause: Option<u32>,
    at: DateTime<Utc>,
}

impl<'a> MsgSpec<'a> {
    fn new(protocol: Protocol, name: &'a str, t_ms: i64) -> Self {
        Self {
            protocol,
            name,
            direction: Direction::Unknown,
            outcome: Outcome::Unknown,
            ids: Vec::new(),
            txn: None,
            cause: None,
            at: at(t_ms),
        }
    }

    fn request(mut self) -> Self {
        self.direction = Direction::Request;
        self.outcome = Outcome::Pending;
        self
    }

    fn response(mut self, outcome: Outcome) -> Self {
        self.direction = Direction::Response;
        self.outcome = outcome;
        self
    }

    fn id(mut self, kind: IdentifierKind, value: &str) -> Self {
        self.ids.push(Identifier::new(kind, value));
        self
    }

    fn txn(mut self, txn: u64) -> Self {
        self.txn = Some(txn);
        self
    }

    fn cause(mut self, cause: u32) -> Self {
        self.cause = Some(cause);
        self
    }

    fn build(self, link: &LinkMeta) -> Message {
        let mut msg = Message::from_link(self.protocol, link);
        msg.captured_at = self.at;
        msg.message_name = self.name.to_string();
        msg.direction = self.direction;
        msg.outcome = self.outcome;
        msg.identifiers = self.ids;
        msg.transaction_id = self.txn;
        msg.cause = self.cause;
        msg
    }
}

fn run(shard: &mut Shard, msgs: Vec<Message>) -> Vec<ShardEvent> {
    let mut events = Vec::new();
    let mut claims: Vec<ClaimRequest> = Vec::new();
    for msg in msgs {
        shard.correlate(msg, &mut events, &mut claims);
    }
    assert!(claims.is_empty(), "single-shard runs publish no claims");
    events
}

fn closed(events: Vec<ShardEvent>) -> Vec<Session> {
    events
        .into_iter()
        .filter_map(|e| match e {
            ShardEvent::Closed(s) => Some(*s),
            _ => None,
        })
        .collect()
}

fn diameter_link() -> LinkMeta {
    link([10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868)
}

#[test]
fn test_create_and_lookup_consistency() {
    let mut shard = make_shard();
    let l = diameter_link();
    let ulr = MsgSpec::new(Protocol::Diameter, "ULR", 0)
        .request()
        .id(IdentifierKind::Imsi, IMSI)
        .id(IdentifierKind::DiameterSessionId, "mme.op;1;1")
        .txn(0x1111)
        .build(&l);

    run(&mut shard, vec![ulr]);
    assert_eq!(shard.live_sessions(), 1);

    // Every identifier on the session resolves back to it.
    let by_imsi = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("imsi indexed");
    let by_sid = shard
        .lookup_session(&Identifier::new(
            IdentifierKind::DiameterSessionId,
            "mme.op;1;1",
        ))
        .expect("session-id indexed");
    assert_eq!(by_imsi.session_id, by_sid.session_id);
    assert_eq!(by_imsi.state, SessionState::Active);
    assert_eq!(by_imsi.final_outcome, Outcome::Pending);
    assert_eq!(by_imsi.procedure, Some("S6a_UpdateLocation"));

    shard.audit().expect("index and arena agree");
}

#[test]
fn test_request_response_latency_and_terminal_close() {
    let mut shard = make_shard();
    let l = diameter_link();
    let msgs = vec![
        MsgSpec::new(Protocol::Diameter, "ULR", 0)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .txn(0x1111)
            .build(&l),
        MsgSpec::new(Protocol::Diameter, "ULA", 120)
            .response(Outcome::Success)
            .id(IdentifierKind::Imsi, IMSI)
            .txn(0x1111)
            .build(&l),
    ];
    let mut events = run(&mut shard, msgs);

    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("still live during quiescence");
    assert_eq!(session.state, SessionState::Closing);
    assert_eq!(session.final_outcome, Outcome::Success);
    assert_eq!(session.message_count, 2);
    assert_eq!(session.latencies_ms, vec![120.0]);

    // Quiescence passes; the session terminates and is emitted once.
    shard.tick(at(120 + 1001), &mut events);
    let done = closed(events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].state, SessionState::Terminated);
    assert_eq!(done[0].cdr_outcome(), "Success");
    assert_eq!(done[0].end_at, Some(at(120)));
    assert_eq!(shard.live_sessions(), 0);
    shard.audit().expect("clean after close");
}

#[test]
fn test_failure_cause_first_wins() {
    let mut shard = make_shard();
    let l = diameter_link();
    let msgs = vec![
        MsgSpec::new(Protocol::Diameter, "ULR", 0)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .build(&l),
        MsgSpec::new(Protocol::Diameter, "ULA", 50)
            .response(Outcome::Failure)
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .cause(5001)
            .build(&l),
        MsgSpec::new(Protocol::Diameter, "ULA", 80)
            .response(Outcome::Failure)
            .id(IdentifierKind::Imsi, IMSI)
            .cause(5012)
            .build(&l),
    ];
    run(&mut shard, msgs);

    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("live in quiescence");
    assert_eq!(session.final_outcome, Outcome::Failure);
    assert_eq!(session.cause, Some(5001), "first failure cause sticks");
}

#[test]
fn test_merge_preserves_earliest_and_unions() {
    let mut shard = make_shard();
    let l = diameter_link();

    // Two disjoint provisional sessions, then a bridge.
    let msgs = vec![
        MsgSpec::new(Protocol::S1ap, "InitialUEMessage", 0)
            .request()
            .id(IdentifierKind::MmeUeId, "42")
            .build(&l),
        MsgSpec::new(Protocol::Gtpv2C, "EchoRequest", 100)
            .request()
            .id(IdentifierKind::Teid, "0x12345678")
            .build(&l),
        MsgSpec::new(Protocol::Nas, "AttachRequest", 200)
            .request()
            .id(IdentifierKind::MmeUeId, "42")
            .id(IdentifierKind::Imsi, IMSI)
            .id(IdentifierKind::Teid, "0x12345678")
            .build(&l),
    ];
    run(&mut shard, msgs);

    // One surviving session with the earliest start and the union.
    assert_eq!(shard.live_sessions(), 1);
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("survivor owns the IMSI");
    assert_eq!(session.start_at, at(0));
    assert_eq!(session.message_count, 3);
    assert_eq!(session.procedure, Some("4G_Attach"));
    for (kind, value) in [
        (IdentifierKind::MmeUeId, "42"),
        (IdentifierKind::Teid, "0x12345678"),
        (IdentifierKind::Imsi, IMSI),
    ] {
        let hit = shard
            .lookup_session(&Identifier::new(kind, value))
            .expect("all identifiers redirected to the survivor");
        assert_eq!(hit.session_id, session.session_id);
    }
    assert!(session.protocols_seen.contains(&Protocol::S1ap));
    assert!(session.protocols_seen.contains(&Protocol::Gtpv2C));
    assert!(session.protocols_seen.contains(&Protocol::Nas));
    shard.audit().expect("merge left the index consistent");

    // Absorbed sessions never surface as independent CDRs.
    let mut events = Vec::new();
    shard.close_all(at(1000), &mut events);
    assert_eq!(closed(events).len(), 1);
}

#[test]
fn test_merge_tie_breaks_on_message_count() {
    let mut shard = make_shard();
    let l = diameter_link();

    // Session A gets two messages, B one, both starting at t=0.
    let msgs = vec![
        MsgSpec::new(Protocol::Gtpv2C, "EchoRequest", 0)
            .request()
            .id(IdentifierKind::Teid, "0xAAAA0000")
            .build(&l),
        MsgSpec::new(Protocol::Gtpv2C, "EchoRequest", 0)
            .request()
            .id(IdentifierKind::Seid, "0xBBBB0000")
            .build(&l),
        MsgSpec::new(Protocol::Gtpv2C, "EchoRequest", 10)
            .request()
            .id(IdentifierKind::Teid, "0xAAAA0000")
            .build(&l),
    ];
    run(&mut shard, msgs);
    let a_id = shard
        .lookup_session(&Identifier::new(IdentifierKind::Teid, "0xAAAA0000"))
        .expect("A live")
        .session_id
        .clone();

    let bridge = MsgSpec::new(Protocol::Gtpv2C, "ModifyBearerRequest", 20)
        .request()
        .id(IdentifierKind::Teid, "0xAAAA0000")
        .id(IdentifierKind::Seid, "0xBBBB0000")
        .build(&l);
    run(&mut shard, vec![bridge]);

    let survivor = shard
        .lookup_session(&Identifier::new(IdentifierKind::Seid, "0xBBBB0000"))
        .expect("survivor indexed under both");
    assert_eq!(survivor.session_id, a_id, "larger message count wins the tie");
    assert_eq!(survivor.message_count, 4);
}

#[test]
fn test_changed_identifier_is_added_not_replaced() {
    let mut shard = make_shard();
    let l = diameter_link();
    let msgs = vec![
        MsgSpec::new(Protocol::Diameter, "CCR", 0)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .id(IdentifierKind::DiameterSessionId, "pgw;1;old")
            .build(&l),
        MsgSpec::new(Protocol::Diameter, "CCR", 100)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .id(IdentifierKind::DiameterSessionId, "pgw;1;new")
            .build(&l),
    ];
    run(&mut shard, msgs);

    assert_eq!(shard.live_sessions(), 1);
    for sid in ["pgw;1;old", "pgw;1;new"] {
        assert!(
            shard
                .lookup_session(&Identifier::new(
                    IdentifierKind::DiameterSessionId,
                    sid
                ))
                .is_some(),
            "both session-ids stay indexed"
        );
    }
}

#[test]
fn test_response_timeout_boundary() {
    // Diameter response timeout is 10s in the test config.
    let mut shard = make_shard();
    let l = diameter_link();

    let msgs = vec![
        MsgSpec::new(Protocol::Diameter, "ULR", 0)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .build(&l),
        // One millisecond under the deadline still matches.
        MsgSpec::new(Protocol::Diameter, "ULA", 9_999)
            .response(Outcome::Success)
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .build(&l),
    ];
    run(&mut shard, msgs);
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("live");
    assert_eq!(session.latencies_ms.len(), 1);
    assert_eq!(session.timeout_count, 0);

    // Exactly at the deadline counts as a timeout.
    let mut shard = make_shard();
    let msgs = vec![
        MsgSpec::new(Protocol::Diameter, "ULR", 0)
            .request()
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .build(&l),
        MsgSpec::new(Protocol::Diameter, "ULA", 10_000)
            .response(Outcome::Success)
            .id(IdentifierKind::Imsi, IMSI)
            .txn(1)
            .build(&l),
    ];
    run(&mut shard, msgs);
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("live");
    assert!(session.latencies_ms.is_empty());
    assert_eq!(session.timeout_count, 1);
}

#[test]
fn test_unanswered_request_times_out_then_evicts() {
    let mut shard = make_shard();
    let l = diameter_link();
    let mut events = Vec::new();

    run(
        &mut shard,
        vec![
            MsgSpec::new(Protocol::Diameter, "ULR", 0)
                .request()
                .id(IdentifierKind::Imsi, IMSI)
                .txn(7)
                .build(&l),
        ],
    );

    // Past the response timeout the exchange is counted.
    shard.tick(at(10_001), &mut events);
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("still live");
    assert_eq!(session.timeout_count, 1);
    assert_eq!(session.final_outcome, Outcome::Pending);

    // Past the Diameter idle timeout (30s) the session drains out.
    shard.tick(at(41_000), &mut events);
    shard.tick(at(43_000), &mut events);
    let done = closed(events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].cdr_outcome(), "Timeout");
    assert_eq!(done[0].state, SessionState::Terminated);
}

#[test]
fn test_idle_eviction_sets_end_at() {
    let mut shard = make_shard();
    let l = diameter_link();
    let mut events = Vec::new();

    run(
        &mut shard,
        vec![
            MsgSpec::new(Protocol::Diameter, "NOR", 0)
                .request()
                .id(IdentifierKind::Imsi, IMSI)
                .build(&l),
        ],
    );

    // Active → Closing at the idle horizon, Terminated after quiescence.
    shard.tick(at(30_500), &mut events);
    shard.tick(at(32_000), &mut events);
    let done = closed(events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].state, SessionState::Terminated);
    assert_eq!(done[0].end_at, Some(at(30_500)));
}

#[test]
fn test_lru_eviction_in_order() {
    let mut shard = make_shard_with(|cfg| {
        cfg.correlator.max_sessions_per_shard = 4;
    });
    let l = diameter_link();

    let mut events = Vec::new();
    let mut claims = Vec::new();
    let mut created: Vec<String> = Vec::new();
    for i in 0..14 {
        let msg = MsgSpec::new(Protocol::Diameter, "ULR", i as i64 * 10)
            .request()
            .id(IdentifierKind::Imsi, &format!("23415000000000{i:02}"))
            .build(&l);
        shard.correlate(msg, &mut events, &mut claims);
        let session = shard
            .lookup_session(&Identifier::new(
                IdentifierKind::Imsi,
                &format!("23415000000000{i:02}"),
            ))
            .expect("just created");
        created.push(session.session_id.clone());
    }

    assert_eq!(shard.live_sessions(), 4);
    let evicted = closed(events);
    assert_eq!(evicted.len(), 10);
    for (i, session) in evicted.iter().enumerate() {
        assert_eq!(session.state, SessionState::Evicted);
        assert_eq!(
            session.session_id, created[i],
            "oldest sessions leave first"
        );
    }
    shard.audit().expect("evictions left the index clean");
}

#[test]
fn test_release_message_closes_session() {
    let mut shard = make_shard();
    let l = diameter_link();
    run(
        &mut shard,
        vec![
            MsgSpec::new(Protocol::Gtpv2C, "CreateSessionRequest", 0)
                .request()
                .id(IdentifierKind::Imsi, IMSI)
                .build(&l),
            MsgSpec::new(Protocol::Gtpv2C, "DeleteSessionRequest", 500)
                .request()
                .id(IdentifierKind::Imsi, IMSI)
                .build(&l),
        ],
    );
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("in quiescence");
    assert_eq!(session.state, SessionState::Closing);
}

#[test]
fn test_orphan_response_flags_conflict() {
    let mut shard = make_shard();
    let l = diameter_link();
    run(
        &mut shard,
        vec![
            MsgSpec::new(Protocol::Diameter, "ULA", 0)
                .response(Outcome::Unknown)
                .id(IdentifierKind::Imsi, IMSI)
                .txn(99)
                .build(&l),
        ],
    );
    let session = shard
        .lookup_session(&Identifier::new(IdentifierKind::Imsi, IMSI))
        .expect("live");
    assert!(session.conflict, "answer without a request is flagged");
}

#[test]
fn test_merge_is_order_insensitive() {
    let l = diameter_link();
    let build = |order: &[usize]| -> Vec<Session> {
        let specs = |i: usize| match i {
            0 => MsgSpec::new(Protocol::S1ap, "InitialUEMessage", 0)
                .request()
                .id(IdentifierKind::MmeUeId, "42"),
            1 => MsgSpec::new(Protocol::Nas, "AttachRequest", 200)
                .request()
                .id(IdentifierKind::MmeUeId, "42")
                .id(IdentifierKind::Imsi, IMSI),
            _ => MsgSpec::new(Protocol::Gtpv2C, "CreateSessionRequest", 400)
                .request()
                .id(IdentifierKind::Imsi, IMSI)
                .id(IdentifierKind::Teid, "0x12345678"),
        };
        let mut shard = make_shard();
        let mut events = run(
            &mut shard,
            order.iter().map(|&i| specs(i).build(&l)).collect(),
        );
        shard.close_all(at(10_000), &mut events);
        closed(events)
    };

    for order in [[0usize, 1, 2], [2, 1, 0], [1, 0, 2]] {
        let done = build(&order);
        assert_eq!(done.len(), 1, "order {order:?} must converge to one session");
        assert_eq!(done[0].message_count, 3);
        let kinds: Vec<IdentifierKind> = {
            let mut kinds: Vec<_> =
                done[0].identifiers.iter().map(|i| i.kind).collect();
            kinds.sort_by_key(|k| format!("{k}"));
            kinds.dedup();
            kinds
        };
        assert_eq!(
            kinds.len(),
            3,
            "identifier kinds survive any order: {kinds:?}"
        );
    }
}

#[test]
fn test_reorder_buffer_orders_by_capture_time() {
    let l = diameter_link();
    let mut buf = ReorderBuffer::new(std::time::Duration::from_millis(100));

    let make = |name: &str, t: i64| {
        MsgSpec::new(Protocol::Diameter, name, t)
            .request()
            .build(&l)
    };

    assert!(buf.push(make("a", 50)).is_empty());
    assert!(buf.push(make("b", 20)).is_empty());
    // A message 150ms ahead pushes the high-water past both.
    let released = buf.push(make("c", 200));
    let names: Vec<&str> = released.iter().map(|m| m.message_name.as_str()).collect();
    assert_eq!(names, ["b", "a"], "released in capture order");

    let rest = buf.flush();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].message_name, "c");
}
