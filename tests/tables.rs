// tests/tables.rs
//! Filter-table hypercalls and dispatcher behavior

mod common;

use common::*;
use v4v::abi::{
    Address, FabricInfo, OpCode, SendAddr, TablesList, TablesRule, DOMID_ANY, PORT_ANY,
};
use v4v::errors::{ECONNREFUSED, EINVAL, ENOSYS, SUCCESS};
use v4v::hypercall::{self, POSITION_NONE};
use v4v::GuestHandle;

const RULE_ADDR: u64 = 0x400;
const LIST_ADDR: u64 = 0x500;
const INFO_ADDR: u64 = 0x700;

fn wire_rule(src_dom: u16, src_port: u32, dst_dom: u16, dst_port: u32, accept: u32) -> TablesRule {
    TablesRule {
        src: Address::new(src_dom, src_port),
        dst: Address::new(dst_dom, dst_port),
        accept,
    }
}

fn add_rule(f: &v4v::Fabric, p: &TestPlatform, caller: u16, rule: &TablesRule, pos: u32) -> i64 {
    p.put(caller, RULE_ADDR, rule);
    hypercall::op(
        f,
        caller,
        OpCode::TablesAdd as u32,
        GuestHandle(RULE_ADDR),
        GuestHandle::NULL,
        pos,
        0,
    )
}

fn list_rules(
    f: &v4v::Fabric,
    p: &TestPlatform,
    caller: u16,
    start: u32,
    max: u32,
) -> (i64, Vec<TablesRule>) {
    p.put(caller, LIST_ADDR, &TablesList { start_rule: start, nb_rules: max });
    let rc = hypercall::op(
        f,
        caller,
        OpCode::TablesList as u32,
        GuestHandle(LIST_ADDR),
        GuestHandle::NULL,
        0,
        0,
    );
    let produced: u32 = p.get(caller, LIST_ADDR + 4);
    let rules = (0..produced as u64)
        .map(|i| p.get::<TablesRule>(caller, LIST_ADDR + 8 + i * 20))
        .collect();
    (rc, rules)
}

#[test]
fn rules_round_trip_through_the_dispatcher() {
    let (p, f) = fabric_with_domains(&[0]);

    assert_eq!(add_rule(&f, &p, 0, &wire_rule(2, PORT_ANY, 3, PORT_ANY, 0), 1), SUCCESS);
    assert_eq!(add_rule(&f, &p, 0, &wire_rule(DOMID_ANY, PORT_ANY, DOMID_ANY, PORT_ANY, 1), 2), SUCCESS);

    let (rc, rules) = list_rules(&f, &p, 0, 0, 10);
    assert_eq!(rc, SUCCESS);
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].src.domain, 2);
    assert_eq!(rules[0].accept, 0);
    assert_eq!(rules[1].src.domain, DOMID_ANY);
    assert_eq!(rules[1].accept, 1);
}

#[test]
fn listing_then_adding_at_the_next_position_preserves_prior_rules() {
    let (p, f) = fabric_with_domains(&[0]);

    for port in 1..=3u32 {
        assert_eq!(add_rule(&f, &p, 0, &wire_rule(1, port, 2, port, 1), port), SUCCESS);
    }

    let (rc, before) = list_rules(&f, &p, 0, 0, 10);
    assert_eq!(rc, SUCCESS);

    // append at the position one past the listed window
    let next = before.len() as u32 + 1;
    assert_eq!(add_rule(&f, &p, 0, &wire_rule(1, 99, 2, 99, 0), next), SUCCESS);

    let (_, after) = list_rules(&f, &p, 0, 0, 10);
    assert_eq!(after.len(), before.len() + 1);
    for (i, rule) in before.iter().enumerate() {
        assert_eq!(after[i].src.port, rule.src.port, "prior rule {i} moved");
    }
    assert_eq!(after.last().unwrap().src.port, 99);
}

#[test]
fn list_windows_and_empty_capacity() {
    let (p, f) = fabric_with_domains(&[0]);
    for port in 1..=5u32 {
        assert_eq!(add_rule(&f, &p, 0, &wire_rule(1, port, 2, port, 1), port), SUCCESS);
    }

    let (rc, window) = list_rules(&f, &p, 0, 2, 2);
    assert_eq!(rc, SUCCESS);
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].src.port, 3);
    assert_eq!(window[1].src.port, 4);

    // zero capacity is an invalid request
    let (rc, _) = list_rules(&f, &p, 0, 0, 0);
    assert_eq!(rc, EINVAL);

    // a window past the end produces nothing
    let (rc, window) = list_rules(&f, &p, 0, 9, 4);
    assert_eq!(rc, SUCCESS);
    assert!(window.is_empty());
}

#[test]
fn del_by_position_by_match_and_flush() {
    let (p, f) = fabric_with_domains(&[0]);
    for port in 1..=3u32 {
        assert_eq!(add_rule(&f, &p, 0, &wire_rule(1, port, 2, port, 1), port), SUCCESS);
    }

    // by 1-based position
    let rc = hypercall::op(
        &f,
        0,
        OpCode::TablesDel as u32,
        GuestHandle::NULL,
        GuestHandle::NULL,
        2,
        0,
    );
    assert_eq!(rc, SUCCESS);
    let (_, rules) = list_rules(&f, &p, 0, 0, 10);
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].src.port, 3);

    // by pattern match
    p.put(0, RULE_ADDR, &wire_rule(1, 3, 2, 3, 0));
    let rc = hypercall::op(
        &f,
        0,
        OpCode::TablesDel as u32,
        GuestHandle(RULE_ADDR),
        GuestHandle::NULL,
        POSITION_NONE,
        0,
    );
    assert_eq!(rc, SUCCESS);
    assert_eq!(f.filter().len(), 1);

    // null rule and no position flushes everything
    let rc = hypercall::op(
        &f,
        0,
        OpCode::TablesDel as u32,
        GuestHandle::NULL,
        GuestHandle::NULL,
        POSITION_NONE,
        0,
    );
    assert_eq!(rc, SUCCESS);
    assert!(f.filter().is_empty());
}

#[test]
fn sendv_and_info_flow_through_the_dispatcher() {
    let (p, f) = fabric_with_domains(&[1, 2]);
    let ring = install_ring(&f, &p, 1, RING_BASE, 0x10, 2, 4096);

    p.write_guest(2, DATA_ADDR, b"via dispatch");
    p.put(2, IOV_TABLE_ADDR, &v4v::abi::Iov::new(DATA_ADDR, 12));
    p.put(
        2,
        SEND_ADDR_ADDR,
        &SendAddr { src: Address::new(2, 5), dst: Address::new(1, 0x10) },
    );

    let rc = hypercall::op(
        &f,
        2,
        OpCode::Sendv as u32,
        GuestHandle(SEND_ADDR_ADDR),
        GuestHandle(IOV_TABLE_ADDR),
        1,
        0x42,
    );
    assert_eq!(rc, 12);

    let (header, bytes) = ring.consume(&p).expect("message");
    assert_eq!(header.message_type, 0x42);
    assert_eq!(bytes, b"via dispatch");

    let rc = hypercall::op(
        &f,
        2,
        OpCode::Info as u32,
        GuestHandle(INFO_ADDR),
        GuestHandle::NULL,
        0,
        0,
    );
    assert_eq!(rc, SUCCESS);
    let info: FabricInfo = p.get(2, INFO_ADDR);
    assert_eq!(info.ring_magic, v4v::abi::RING_MAGIC);
    assert_eq!(info.evtchn, f.info(2).unwrap().evtchn);
}

#[test]
fn rejected_sends_report_econnrefused_through_the_dispatcher() {
    let (p, f) = fabric_with_domains(&[1, 2]);
    install_ring(&f, &p, 1, RING_BASE, 0x10, 2, 4096);
    assert_eq!(add_rule(&f, &p, 1, &wire_rule(DOMID_ANY, PORT_ANY, 1, 0x10, 0), 1), SUCCESS);

    p.put(2, IOV_TABLE_ADDR, &v4v::abi::Iov::new(DATA_ADDR, 4));
    p.put(
        2,
        SEND_ADDR_ADDR,
        &SendAddr { src: Address::new(2, 5), dst: Address::new(1, 0x10) },
    );
    let rc = hypercall::op(
        &f,
        2,
        OpCode::Sendv as u32,
        GuestHandle(SEND_ADDR_ADDR),
        GuestHandle(IOV_TABLE_ADDR),
        1,
        0,
    );
    assert_eq!(rc, ECONNREFUSED);
}

#[test]
fn unknown_commands_are_enosys() {
    let (_p, f) = fabric_with_domains(&[1]);
    let rc = hypercall::op(&f, 1, 0xdead, GuestHandle::NULL, GuestHandle::NULL, 0, 0);
    assert_eq!(rc, ENOSYS);
}

#[test]
fn global_instance_routes_do_op() {
    // before init the subsystem is absent
    assert!(v4v::instance().is_none());
    assert_eq!(
        v4v::do_op(1, OpCode::Info as u32, GuestHandle(INFO_ADDR), GuestHandle::NULL, 0, 0),
        ENOSYS
    );

    let platform = TestPlatform::new();
    platform.add_domain(1);
    let fabric = v4v::init(platform.clone());
    fabric.domain_init(1).expect("domain init");

    let rc = v4v::do_op(
        1,
        OpCode::Info as u32,
        GuestHandle(INFO_ADDR),
        GuestHandle::NULL,
        0,
        0,
    );
    assert_eq!(rc, SUCCESS);
    let info: FabricInfo = platform.get(1, INFO_ADDR);
    assert_eq!(info.data_magic, v4v::abi::RING_DATA_MAGIC);

    // a second init keeps the first instance
    let again = v4v::init(TestPlatform::new());
    assert!(std::ptr::eq(again, fabric));
}
