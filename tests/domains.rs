//! Domain admission and accounting through the host facade.

use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use hostrt::{
    domain::{DomainId, DomainManager},
    host::HostEventKind,
    memory::{AllocationType, FreeType, MallocFlags, MemoryCriticalLevel, MemoryProtection},
    sync::{WaitOptions, WaitOutcome},
    thread::NativeThreadId,
    DomainLimits, Error, HostConfig, HostControl,
};

struct Quiet;

impl DomainManager for Quiet {
    fn on_main_thread_exit(&self, _domain: DomainId, _is_empty: bool) {}
}

fn host(limits: DomainLimits) -> HostControl {
    let host = HostControl::new(HostConfig {
        limits,
        ..Default::default()
    })
    .unwrap();
    host.set_domain_manager(DomainId(1), Arc::new(Quiet)).unwrap();
    host
}

#[test]
fn creating_thread_migrates_to_new_domain() {
    let host = host(DomainLimits::default());
    let me = NativeThreadId::current();

    host.set_domain_manager(DomainId(2), Arc::new(Quiet)).unwrap();

    assert_eq!(host.thread_count(DomainId(1)).unwrap(), 0);
    assert_eq!(host.thread_count(DomainId(2)).unwrap(), 1);
    assert_eq!(host.domains().domain_of(me), Some(DomainId(2)));
    assert_eq!(host.domains().default_domain(), Some(DomainId(1)));
    assert!(host.domains().is_snippet_thread(me));

    assert!(matches!(
        host.set_domain_manager(DomainId(2), Arc::new(Quiet)),
        Err(Error::DomainExists(DomainId(2)))
    ));
    assert_eq!(host.thread_count(DomainId(2)).unwrap(), 1);
}

#[test]
fn thread_cap_denies_and_recovers() {
    let host = host(DomainLimits::new().with_max_threads_per_domain(2));
    let (tx, rx) = mpsc::channel();

    let first = {
        let tx = tx.clone();
        host.tasks()
            .create_task(0, move || tx.send(NativeThreadId::current()).unwrap())
            .unwrap()
    };
    assert_eq!(host.thread_count(DomainId(1)).unwrap(), 2);

    let denied = host.tasks().create_task(0, || {});
    assert!(matches!(
        denied,
        Err(Error::ThreadLimit {
            domain: DomainId(1),
            limit: 2
        })
    ));
    let event = host.poll_event(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(event.kind, HostEventKind::OutOfTasks);
    assert_eq!(event.domain, DomainId(1));
    assert_eq!(event.thread, Some(NativeThreadId::current()));

    first.start().unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), first.id());
    assert_eq!(
        first
            .join(Some(Duration::from_secs(5)), WaitOptions::empty())
            .unwrap(),
        WaitOutcome::Signaled
    );
    assert_eq!(host.thread_count(DomainId(1)).unwrap(), 1);

    let again = host.tasks().create_task(0, || {}).unwrap();
    again.start().unwrap();
    again
        .join(Some(Duration::from_secs(5)), WaitOptions::empty())
        .unwrap();
    assert_eq!(host.thread_count(DomainId(1)).unwrap(), 1);
}

#[test]
fn heap_budget_is_exact() {
    let host = host(DomainLimits::new().with_max_bytes_per_domain(4096));
    let heap = host.memory().create_allocator(MallocFlags::THREAD_SAFE);

    let block = heap.alloc(4000, MemoryCriticalLevel::TaskCritical).unwrap();
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 4000);

    let denied = heap.alloc(200, MemoryCriticalLevel::TaskCritical);
    assert!(matches!(denied, Err(Error::OutOfMemory { requested: 200 })));
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 4000);
    let event = host.poll_event(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(event.kind, HostEventKind::OutOfMemory);

    // Critical allocations are charged but never denied.
    let critical = heap
        .alloc(200, MemoryCriticalLevel::ProcessCritical)
        .unwrap();
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 4200);

    let address = block.address();
    heap.free(block);
    drop(critical);
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0);
    assert_eq!(host.domains().on_memory_release(address), 0);
    assert_eq!(heap.live_blocks(), 0);
}

#[test]
fn virtual_commit_charges_new_pages_once() {
    let host = host(DomainLimits::unlimited());
    let memory = host.memory();

    let base = memory
        .virtual_alloc(
            None,
            0x10000,
            AllocationType::RESERVE,
            MemoryProtection::READ_WRITE,
            MemoryCriticalLevel::TaskCritical,
        )
        .unwrap();
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0);

    for _ in 0..2 {
        memory
            .virtual_alloc(
                Some(base),
                0x2000,
                AllocationType::COMMIT,
                MemoryProtection::READ_WRITE,
                MemoryCriticalLevel::TaskCritical,
            )
            .unwrap();
        assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0x2000);
    }

    memory.write_virtual(base + 0xff0, &[0xab; 0x20]).unwrap();
    let mut back = [0u8; 0x20];
    memory.read_virtual(base + 0xff0, &mut back).unwrap();
    assert_eq!(back, [0xab; 0x20]);

    memory.virtual_free(base, 0x1000, FreeType::Decommit).unwrap();
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0x1000);

    memory.virtual_free(base, 0, FreeType::Release).unwrap();
    assert_eq!(host.memory_usage(DomainId(1)).unwrap(), 0);
    assert_eq!(memory.region_count(), 0);
}

#[test]
fn unload_drops_pending_events() {
    let host = host(DomainLimits::default());

    assert!(host.unload_domain(DomainId(1)));
    assert!(!host.unload_domain(DomainId(1)));

    host.domains().on_domain_unload(DomainId(1));
    let event = host.poll_event(Some(Duration::ZERO)).unwrap();
    assert_eq!(event.kind, HostEventKind::DomainUnloaded);
    assert!(host.poll_event(Some(Duration::ZERO)).is_none());
    assert!(matches!(
        host.thread_count(DomainId(1)),
        Err(Error::DomainNotFound(DomainId(1)))
    ));
}

/// Every live domain's count equals the threads bound to it, and nothing is bound to a dead
/// domain.
fn assert_conserved(host: &HostControl, threads: &[NativeThreadId], step: &str) {
    let domains = host.domains();
    for id in (1..=4).map(DomainId) {
        let bound = threads
            .iter()
            .filter(|thread| domains.domain_of(**thread) == Some(id))
            .count();
        match domains.thread_count(id) {
            Ok(count) => assert_eq!(count, bound, "{step}: domain {id}"),
            Err(Error::DomainNotFound(_)) => assert_eq!(bound, 0, "{step}: dead domain {id}"),
            Err(other) => panic!("{step}: {other}"),
        }
    }
}

#[test]
fn thread_counts_match_bindings_through_lifecycle() {
    let host = host(DomainLimits::default());
    let domains = host.domains();
    let me = NativeThreadId::current();
    let t: Vec<NativeThreadId> = (0..10).map(|n| NativeThreadId::new(0x7000 + n)).collect();
    let mut all = vec![me];
    all.extend(&t);
    assert_conserved(&host, &all, "start");

    domains.create_domain(DomainId(2), t[0], Arc::new(Quiet)).unwrap();
    domains.create_domain(DomainId(3), t[1], Arc::new(Quiet)).unwrap();
    assert_conserved(&host, &all, "create");

    domains.thread_acquire(me, t[2]).unwrap();
    domains.thread_acquire(t[0], t[3]).unwrap();
    domains.thread_acquire(t[3], t[4]).unwrap();
    assert_eq!(domains.reserve_thread(t[1], t[5]).unwrap(), Some(DomainId(3)));
    assert_conserved(&host, &all, "acquire");

    // A creating thread migrates out of its old domain.
    domains.create_domain(DomainId(4), t[4], Arc::new(Quiet)).unwrap();
    domains.thread_acquire(t[4], t[6]).unwrap();
    assert_conserved(&host, &all, "migrate");

    domains.thread_release(t[2]).unwrap();
    assert!(matches!(
        domains.thread_release(t[2]),
        Err(Error::ThreadNotBound(_))
    ));
    assert_conserved(&host, &all, "release");

    // Main thread exit takes the domain and its bindings with it.
    domains.thread_release(t[0]).unwrap();
    assert!(domains.domain_of(t[3]).is_none());
    assert!(matches!(
        domains.thread_acquire(t[0], t[7]),
        Err(Error::ThreadNotBound(_))
    ));
    assert_conserved(&host, &all, "main exit");

    domains.on_domain_unload(DomainId(3));
    assert!(domains.domain_of(t[5]).is_none());
    assert!(matches!(domains.reserve_thread(t[5], t[7]), Ok(None)));
    assert_conserved(&host, &all, "unload");

    // Reused ids start from their creating thread alone.
    domains.create_domain(DomainId(3), t[8], Arc::new(Quiet)).unwrap();
    domains.thread_acquire(t[8], t[9]).unwrap();
    assert_eq!(domains.thread_count(DomainId(3)).unwrap(), 2);
    assert_conserved(&host, &all, "reuse");

    for thread in [t[6], t[9]] {
        domains.thread_release(thread).unwrap();
        assert_conserved(&host, &all, "drain");
    }
    assert_eq!(domains.thread_count(DomainId(1)).unwrap(), 1);
}
