// src/hypercall.rs
//! Hypercall dispatch
//!
//! The single guest-facing entry point. The external trap path decodes the
//! hypercall registers, resolves the calling domain, and hands the raw
//! arguments to [`op`]; everything guest-struct-shaped is unmarshalled here
//! so the core components below only ever see validated native values.
//!
//! Return convention: non-negative on success (byte counts for sends, zero
//! otherwise), negative errno on failure.

use alloc::vec::Vec;
use core::mem::offset_of;

use crate::abi::{FabricInfo, OpCode, SendAddr, TablesList, TablesRule};
use crate::errors::{self, OpResult, Result, SUCCESS};
use crate::fabric::filter::FilterRule;
use crate::fabric::{guest_mem, Fabric};
use crate::platform::{DomainId, GuestHandle};

/// `arg3` value meaning "no position" for [`OpCode::TablesDel`].
pub const POSITION_NONE: u32 = u32::MAX;

/// Dispatch one hypercall from `caller`.
///
/// `arg1`/`arg2` are guest handles, `arg3`/`arg4` immediate words; their
/// meaning depends on the command (see the crate-level table). An unknown
/// command yields `-ENOSYS`.
pub fn op(
    fabric: &Fabric,
    caller: DomainId,
    cmd: u32,
    arg1: GuestHandle,
    arg2: GuestHandle,
    arg3: u32,
    arg4: u32,
) -> OpResult {
    #[cfg(feature = "op-trace")]
    log::trace!(
        "dom {caller}: op cmd={cmd} arg1={:#x} arg2={:#x} arg3={arg3} arg4={arg4}",
        arg1.0,
        arg2.0,
    );

    let Some(code) = OpCode::from_u32(cmd) else {
        return errors::ENOSYS;
    };

    let rc = match code {
        OpCode::RegisterRing => status(fabric.register_ring(caller, arg1, arg2, arg3)),
        OpCode::UnregisterRing => status(fabric.unregister_ring(caller, arg1)),
        OpCode::Sendv => sendv(fabric, caller, arg1, arg2, arg3, arg4),
        OpCode::Notify => status(fabric.notify(caller, arg1)),
        OpCode::TablesAdd => tables_add(fabric, caller, arg1, arg3),
        OpCode::TablesDel => tables_del(fabric, caller, arg1, arg3),
        OpCode::TablesList => tables_list(fabric, caller, arg1),
        OpCode::Info => info(fabric, caller, arg1),
    };

    #[cfg(feature = "op-trace")]
    log::trace!("dom {caller}: op cmd={cmd} -> {rc}");

    rc
}

fn status(result: Result<()>) -> OpResult {
    match result {
        Ok(()) => SUCCESS,
        Err(e) => e.to_errno(),
    }
}

fn sendv(
    fabric: &Fabric,
    caller: DomainId,
    addr_hnd: GuestHandle,
    iovs: GuestHandle,
    niov: u32,
    proto: u32,
) -> OpResult {
    let addr: SendAddr = match guest_mem::read_obj(fabric.platform(), caller, addr_hnd) {
        Ok(addr) => addr,
        Err(e) => return e.to_errno(),
    };
    match fabric.sendv(caller, addr.src, addr.dst, proto, iovs, niov) {
        Ok(sent) => sent,
        Err(e) => e.to_errno(),
    }
}

fn tables_add(
    fabric: &Fabric,
    caller: DomainId,
    rule_hnd: GuestHandle,
    position: u32,
) -> OpResult {
    let wire: TablesRule = match guest_mem::read_obj(fabric.platform(), caller, rule_hnd) {
        Ok(rule) => rule,
        Err(e) => return e.to_errno(),
    };
    status(fabric.filter().add(FilterRule::from_wire(&wire), position))
}

fn tables_del(
    fabric: &Fabric,
    caller: DomainId,
    rule_hnd: GuestHandle,
    position: u32,
) -> OpResult {
    if position != POSITION_NONE {
        fabric.filter().del_at(position);
    } else if !rule_hnd.is_null() {
        let wire: TablesRule = match guest_mem::read_obj(fabric.platform(), caller, rule_hnd) {
            Ok(rule) => rule,
            Err(e) => return e.to_errno(),
        };
        fabric.filter().del_matching(&FilterRule::from_wire(&wire));
    } else {
        fabric.filter().flush();
    }
    SUCCESS
}

fn tables_list(fabric: &Fabric, caller: DomainId, list_hnd: GuestHandle) -> OpResult {
    let header: TablesList = match guest_mem::read_obj(fabric.platform(), caller, list_hnd) {
        Ok(header) => header,
        Err(e) => return e.to_errno(),
    };
    if header.nb_rules == 0 {
        return errors::EINVAL;
    }

    let mut window: Vec<FilterRule> = Vec::new();
    let produced = match fabric
        .filter()
        .list(header.start_rule, header.nb_rules, &mut window)
    {
        Ok(n) => n,
        Err(e) => return e.to_errno(),
    };

    let rules_hnd = list_hnd.offset(size_of::<TablesList>() as u64);
    for (i, rule) in window.iter().enumerate() {
        let slot = rules_hnd.index::<TablesRule>(i as u64);
        if guest_mem::write_obj(fabric.platform(), caller, slot, &rule.to_wire()).is_err() {
            return errors::EFAULT;
        }
    }

    let count_hnd = list_hnd.field(offset_of!(TablesList, nb_rules));
    match guest_mem::write_obj(fabric.platform(), caller, count_hnd, &produced) {
        Ok(()) => SUCCESS,
        Err(e) => e.to_errno(),
    }
}

fn info(fabric: &Fabric, caller: DomainId, info_hnd: GuestHandle) -> OpResult {
    let block: FabricInfo = match fabric.info(caller) {
        Ok(block) => block,
        Err(e) => return e.to_errno(),
    };
    match guest_mem::write_obj(fabric.platform(), caller, info_hnd, &block) {
        Ok(()) => SUCCESS,
        Err(e) => e.to_errno(),
    }
}
