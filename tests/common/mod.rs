// tests/common/mod.rs
//! Test platform and guest-side driver helpers
//!
//! `TestPlatform` stands in for the hypervisor: each domain gets a flat
//! byte arena addressed from 0, frames are (domain, page) pairs with a pin
//! refcount ledger, signals are recorded instead of delivered, and page
//! mapping can be made to fail to exercise fault paths. The `GuestRing`
//! helpers play the role of the guest driver: they lay out descriptors and
//! pfn tables in guest memory and consume messages the way a real consumer
//! would, advancing `rx_ptr`.

#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use v4v::abi::{
    roundup, Address, MessageHeader, RingDesc, RingId, MSG_HEADER_SIZE, PAGE_SIZE,
    RING_HEADER_SIZE,
};
use v4v::{DomainId, Error, EvtchnPort, Fabric, FrameId, GuestHandle, MappedPage, Platform};

/// Pages of guest memory per test domain (256 KiB).
pub const GUEST_PAGES: u64 = 64;

struct DomainMem {
    bytes: UnsafeCell<Box<[u8]>>,
}

// SAFETY: tests serialize access; the cell only exists so mapped-page raw
// writes and arena reads may coexist.
unsafe impl Send for DomainMem {}
unsafe impl Sync for DomainMem {}

/// Mock hypervisor platform.
pub struct TestPlatform {
    mem: Mutex<BTreeMap<DomainId, Arc<DomainMem>>>,
    pins: Mutex<BTreeMap<u64, u32>>,
    ports: Mutex<BTreeMap<DomainId, EvtchnPort>>,
    signals: Mutex<Vec<DomainId>>,
    fail_map: AtomicBool,
    next_port: AtomicU32,
}

impl TestPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(BTreeMap::new()),
            pins: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
            signals: Mutex::new(Vec::new()),
            fail_map: AtomicBool::new(false),
            next_port: AtomicU32::new(100),
        })
    }

    /// Give `domain` a memory arena (and thereby existence).
    pub fn add_domain(&self, domain: DomainId) {
        self.mem.lock().unwrap().entry(domain).or_insert_with(|| {
            Arc::new(DomainMem {
                bytes: UnsafeCell::new(
                    vec![0u8; (GUEST_PAGES * PAGE_SIZE as u64) as usize].into_boxed_slice(),
                ),
            })
        });
    }

    /// Drop `domain` from the platform's domain table.
    pub fn remove_domain(&self, domain: DomainId) {
        self.mem.lock().unwrap().remove(&domain);
    }

    fn arena(&self, domain: DomainId) -> Option<Arc<DomainMem>> {
        self.mem.lock().unwrap().get(&domain).cloned()
    }

    fn arena_slice(mem: &DomainMem) -> &mut [u8] {
        // SAFETY: test-only; accesses are serialized by the test flow.
        unsafe { &mut **mem.bytes.get() }
    }

    /// Raw write into a domain's memory.
    pub fn write_guest(&self, domain: DomainId, addr: u64, bytes: &[u8]) {
        let mem = self.arena(domain).expect("domain memory");
        Self::arena_slice(&mem)[addr as usize..addr as usize + bytes.len()]
            .copy_from_slice(bytes);
    }

    /// Raw read from a domain's memory.
    pub fn read_guest(&self, domain: DomainId, addr: u64, len: usize) -> Vec<u8> {
        let mem = self.arena(domain).expect("domain memory");
        Self::arena_slice(&mem)[addr as usize..addr as usize + len].to_vec()
    }

    /// Typed write into a domain's memory.
    pub fn put<T: Copy>(&self, domain: DomainId, addr: u64, value: &T) {
        // SAFETY: byte view of a Copy value for test serialization.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>())
        };
        self.write_guest(domain, addr, bytes);
    }

    /// Typed read from a domain's memory.
    pub fn get<T: Copy>(&self, domain: DomainId, addr: u64) -> T {
        let bytes = self.read_guest(domain, addr, size_of::<T>());
        // SAFETY: test-only deserialization of repr(C) integer aggregates.
        unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) }
    }

    /// Total outstanding pin references.
    pub fn pin_count(&self) -> usize {
        self.pins.lock().unwrap().values().map(|&c| c as usize).sum()
    }

    /// Recorded signals since the last call, in delivery order.
    pub fn take_signals(&self) -> Vec<DomainId> {
        std::mem::take(&mut *self.signals.lock().unwrap())
    }

    /// Make every subsequent `map_frame` fail (mapping-pool exhaustion).
    pub fn set_fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    fn frame_id(domain: DomainId, page: u64) -> u64 {
        (u64::from(domain) << 32) | page
    }
}

impl Platform for TestPlatform {
    fn domain_exists(&self, domain: DomainId) -> bool {
        self.mem.lock().unwrap().contains_key(&domain)
    }

    fn alloc_event_port(&self, domain: DomainId) -> v4v::Result<EvtchnPort> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.ports.lock().unwrap().insert(domain, port);
        Ok(port)
    }

    fn free_event_port(&self, domain: DomainId, _port: EvtchnPort) {
        self.ports.lock().unwrap().remove(&domain);
    }

    fn signal(&self, domain: DomainId, _port: EvtchnPort) -> v4v::Result<()> {
        self.signals.lock().unwrap().push(domain);
        Ok(())
    }

    fn pin_frame(&self, domain: DomainId, pfn: u64) -> v4v::Result<FrameId> {
        if !self.domain_exists(domain) || pfn >= GUEST_PAGES {
            return Err(Error::InvalidArg);
        }
        let id = Self::frame_id(domain, pfn);
        *self.pins.lock().unwrap().entry(id).or_insert(0) += 1;
        Ok(FrameId(id))
    }

    fn unpin_frame(&self, frame: FrameId) {
        let mut pins = self.pins.lock().unwrap();
        match pins.get_mut(&frame.0) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&frame.0);
            }
            None => panic!("unpin of unpinned frame {:#x}", frame.0),
        }
    }

    fn map_frame(&self, frame: FrameId) -> v4v::Result<MappedPage> {
        if self.fail_map.load(Ordering::SeqCst) {
            return Err(Error::Fault);
        }
        let domain = (frame.0 >> 32) as DomainId;
        let page = frame.0 & 0xffff_ffff;
        let mem = self.arena(domain).ok_or(Error::Fault)?;
        let base = Self::arena_slice(&mem).as_mut_ptr();
        // SAFETY: the arena outlives the test and covers GUEST_PAGES pages.
        let ptr = unsafe { base.add((page as usize) * PAGE_SIZE) };
        Ok(unsafe { MappedPage::new(NonNull::new(ptr).unwrap()) })
    }

    fn unmap_frame(&self, _frame: FrameId, _page: MappedPage) {}

    fn guest_range_ok(&self, domain: DomainId, handle: GuestHandle, len: usize) -> bool {
        self.domain_exists(domain)
            && handle.0.checked_add(len as u64).is_some_and(|end| end <= GUEST_PAGES * PAGE_SIZE as u64)
    }

    fn copy_from_guest(
        &self,
        domain: DomainId,
        src: GuestHandle,
        dst: &mut [u8],
    ) -> v4v::Result<()> {
        if !self.guest_range_ok(domain, src, dst.len()) {
            return Err(Error::Fault);
        }
        let mem = self.arena(domain).ok_or(Error::Fault)?;
        let base = Self::arena_slice(&mem).as_ptr();
        // SAFETY: range-checked above; raw copy avoids aliasing the
        // destination, which may be a mapped ring page.
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(src.0 as usize), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn copy_to_guest(&self, domain: DomainId, dst: GuestHandle, src: &[u8]) -> v4v::Result<()> {
        if !self.guest_range_ok(domain, dst, src.len()) {
            return Err(Error::Fault);
        }
        let mem = self.arena(domain).ok_or(Error::Fault)?;
        let base = Self::arena_slice(&mem).as_mut_ptr();
        // SAFETY: range-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(dst.0 as usize), src.len());
        }
        Ok(())
    }
}

/// Guest scratch addresses used by the driver helpers. Ring regions live at
/// page 8 and above; everything below is scratch.
pub const PFN_TABLE_ADDR: u64 = 0xf00;
pub const SEND_ADDR_ADDR: u64 = 0x800;
pub const IOV_TABLE_ADDR: u64 = 0x900;
pub const DATA_ADDR: u64 = 0x2000;
pub const RING_BASE: u64 = 8 * PAGE_SIZE as u64;

/// A registered ring as the guest driver sees it.
#[derive(Clone, Copy)]
pub struct GuestRing {
    pub owner: DomainId,
    pub base: u64,
    pub id: RingId,
    pub len: u32,
}

impl GuestRing {
    pub fn desc(&self, p: &TestPlatform) -> RingDesc {
        p.get(self.owner, self.base)
    }

    pub fn rx_ptr(&self, p: &TestPlatform) -> u32 {
        p.get(self.owner, self.base + 24)
    }

    pub fn tx_ptr(&self, p: &TestPlatform) -> u32 {
        p.get(self.owner, self.base + 28)
    }

    fn payload_byte(&self, p: &TestPlatform, offset: u32) -> u8 {
        let addr = self.base + u64::from(RING_HEADER_SIZE) + u64::from(offset % self.len);
        p.read_guest(self.owner, addr, 1)[0]
    }

    fn payload_bytes(&self, p: &TestPlatform, offset: u32, len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| self.payload_byte(p, offset + i)).collect()
    }

    /// Consume one message the way the guest driver does: parse the header
    /// at `rx_ptr`, copy the payload out, advance `rx_ptr` to the next
    /// 16-byte boundary.
    pub fn consume(&self, p: &TestPlatform) -> Option<(MessageHeader, Vec<u8>)> {
        let rx = self.rx_ptr(p);
        let tx = self.tx_ptr(p);
        if rx == tx {
            return None;
        }

        let header_bytes = self.payload_bytes(p, rx, MSG_HEADER_SIZE as usize);
        // SAFETY: test-only deserialization of a repr(C) header.
        let header: MessageHeader =
            unsafe { std::ptr::read_unaligned(header_bytes.as_ptr().cast()) };
        assert!(header.len >= MSG_HEADER_SIZE, "corrupt message header");

        let payload_len = (header.len - MSG_HEADER_SIZE) as usize;
        let payload = self.payload_bytes(p, rx + MSG_HEADER_SIZE, payload_len);

        let next_rx = (rx + roundup(u64::from(header.len)) as u32) % self.len;
        p.put(self.owner, self.base + 24, &next_rx);
        Some((header, payload))
    }

    /// Drain every readable message.
    pub fn consume_all(&self, p: &TestPlatform) -> Vec<(MessageHeader, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(msg) = self.consume(p) {
            out.push(msg);
        }
        out
    }
}

/// Number of pages a ring of payload `len` needs.
pub fn npage_for(len: u32) -> u32 {
    (RING_HEADER_SIZE + len).div_ceil(PAGE_SIZE as u32)
}

/// Lay out a descriptor (with the given pointers) and pfn table in guest
/// memory and register the ring.
pub fn install_ring_with_ptrs(
    fabric: &Fabric,
    p: &TestPlatform,
    owner: DomainId,
    base: u64,
    port: u32,
    partner: u16,
    len: u32,
    rx: u32,
    tx: u32,
) -> v4v::Result<GuestRing> {
    let id = RingId::new(Address::new(owner, port), partner);
    let mut desc = RingDesc::new(id, len);
    desc.rx_ptr = rx;
    desc.tx_ptr = tx;
    p.put(owner, base, &desc);

    let npage = npage_for(len);
    for i in 0..u64::from(npage) {
        p.put(owner, PFN_TABLE_ADDR + i * 8, &((base >> 12) + i));
    }

    fabric.register_ring(owner, GuestHandle(base), GuestHandle(PFN_TABLE_ADDR), npage)?;
    Ok(GuestRing { owner, base, id, len })
}

/// Register an initially-empty ring at `base`.
pub fn install_ring(
    fabric: &Fabric,
    p: &TestPlatform,
    owner: DomainId,
    base: u64,
    port: u32,
    partner: u16,
    len: u32,
) -> GuestRing {
    install_ring_with_ptrs(fabric, p, owner, base, port, partner, len, 0, 0)
        .expect("ring registration")
}

/// Stage `chunks` in the sender's memory, build the iovec table, and send.
pub fn guest_sendv(
    fabric: &Fabric,
    p: &TestPlatform,
    sender: DomainId,
    src: Address,
    dst: Address,
    proto: u32,
    chunks: &[&[u8]],
) -> v4v::Result<i64> {
    let mut data_addr = DATA_ADDR;
    for (i, chunk) in chunks.iter().enumerate() {
        p.write_guest(sender, data_addr, chunk);
        p.put(
            sender,
            IOV_TABLE_ADDR + (i * 16) as u64,
            &v4v::abi::Iov::new(data_addr, chunk.len() as u32),
        );
        data_addr += roundup(chunk.len() as u64);
    }
    fabric.sendv(
        sender,
        src,
        dst,
        proto,
        GuestHandle(IOV_TABLE_ADDR),
        chunks.len() as u32,
    )
}

/// A fabric over a fresh platform with the given domains initialized.
pub fn fabric_with_domains(domains: &[DomainId]) -> (Arc<TestPlatform>, Fabric) {
    let platform = TestPlatform::new();
    for &d in domains {
        platform.add_domain(d);
    }
    let fabric = Fabric::new(platform.clone());
    for &d in domains {
        fabric.domain_init(d).expect("domain init");
    }
    (platform, fabric)
}
