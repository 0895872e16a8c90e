use std::sync::Arc;

use sigscope_rs::{
    correlate::shard::{ClaimRequest, Shard, ShardEvent},
    dict::Dictionary,
    pipeline::replay::{parse_event_lines, replay_records},
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{Direction, Message, Outcome, Protocol},
    },
    sink::event::EventRecord,
};

use super::{at, link, test_config};

fn make_msg(
    name: &str,
    direction: Direction,
    outcome: Outcome,
    ids: &[(IdentifierKind, &str)],
    txn: Option<u64>,
    t_ms: i64,
) -> Message {
    let l = link([10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868);
    let mut msg = Message::from_link(Protocol::Diameter, &l);
    msg.captured_at = at(t_ms);
    msg.message_name = name.to_string();
    msg.direction = direction;
    msg.outcome = outcome;
    msg.identifiers = ids
        .iter()
        .map(|(k, v)| Identifier::new(*k, *v))
        .collect();
    msg.transaction_id = txn;
    msg
}

/// Runs a scenario live, captures the emitted event records, replays
/// them, and checks the reconstruction matches the original sessions.
#[test]
fn test_event_replay_reconstructs_sessions() {
    let cfg = Arc::new(test_config());
    let dict = Arc::new(Dictionary::new());

    let msgs = vec![
        make_msg(
            "ULR",
            Direction::Request,
            Outcome::Pending,
            &[(IdentifierKind::Imsi, "234150123456789")],
            Some(1),
            0,
        ),
        make_msg(
            "ULA",
            Direction::Response,
            Outcome::Success,
            &[(IdentifierKind::Imsi, "234150123456789")],
            Some(1),
            120,
        ),
        make_msg(
            "AIR",
            Direction::Request,
            Outcome::Pending,
            &[(IdentifierKind::Imsi, "234150999999999")],
            Some(2),
            50,
        ),
    ];

    let mut shard = Shard::new(0, Arc::clone(&cfg), Arc::clone(&dict));
    let mut events: Vec<ShardEvent> = Vec::new();
    let mut claims: Vec<ClaimRequest> = Vec::new();
    for msg in msgs {
        shard.correlate(msg, &mut events, &mut claims);
    }
    shard.close_all(at(10_000), &mut events);

    let mut records: Vec<EventRecord> = Vec::new();
    let mut originals = Vec::new();
    for event in events {
        match event {
            ShardEvent::Event(record) => records.push(record),
            ShardEvent::Closed(session) => originals.push(*session),
            _ => {},
        }
    }
    assert_eq!(records.len(), 3);
    assert_eq!(originals.len(), 2);

    // Through the wire format and back.
    let lines: Vec<String> = records
        .iter()
        .map(|r| serde_json::to_string(r).expect("serializes"))
        .collect();
    let parsed = parse_event_lines(&lines.join("\n")).expect("parses back");

    let rebuilt = replay_records(&cfg, &dict, &parsed);
    assert_eq!(rebuilt.len(), originals.len());

    let digest = |sessions: &[sigscope_rs::correlate::session::Session]| {
        let mut set: Vec<(u64, String, Vec<String>)> = sessions
            .iter()
            .map(|s| {
                let mut ids: Vec<String> =
                    s.identifiers.iter().map(|i| i.to_string()).collect();
                ids.sort();
                (s.message_count, format!("{:?}", s.final_outcome), ids)
            })
            .collect();
        set.sort();
        set
    };
    assert_eq!(digest(&originals), digest(&rebuilt));

    // Latency pairing also reconstructs.
    let ulr_session = rebuilt
        .iter()
        .find(|s| {
            s.identifiers
                .contains(&Identifier::new(IdentifierKind::Imsi, "234150123456789"))
        })
        .expect("ULR/ULA session rebuilt");
    assert_eq!(ulr_session.latencies_ms, vec![120.0]);
    assert_eq!(ulr_session.cdr_outcome(), "Success");
}

#[test]
fn test_malformed_records_do_not_create_sessions() {
    let cfg = Arc::new(test_config());
    let dict = Arc::new(Dictionary::new());

    let undecodable = EventRecord::undecodable(
        at(0),
        Protocol::Diameter,
        "malformed PDU: AVP 263 length 900 exceeds remaining 64",
        None,
    );
    let rebuilt = replay_records(&cfg, &dict, &[undecodable]);
    assert!(rebuilt.is_empty(), "sessionless records replay to nothing");
}
