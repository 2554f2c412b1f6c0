//! End-to-end scenarios across kernel, protothreads, sync objects, streams
//! and timers

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use protosm::{
    Acquire, Context, Event, EventNotify, Kernel, Machine, Mailbox, Parent, Pt, PtStatus,
    SharedStream, SmError, State, SyncId, TimerService, Transition,
};

const GO: Event = Event::user(0);
const WAKE: Event = Event::user(1);
const RELEASE: Event = Event::user(2);
const RX_DATA: Event = Event::user(3);
const RX_SPACE: Event = Event::user(4);
const TICK: Event = Event::user(5);
const CONNECTED: Event = Event::user(6);

type Pipe = SharedStream<'static, 65>;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

struct Reader {
    rx: &'static Pipe,
    got: Vec<u8>,
    peer_connected: bool,
}

fn reading(_: &mut Context<'_, '_>, reader: &mut Reader, evt: Event) -> Transition<Reader> {
    match evt {
        RX_DATA => {
            let mut buf = [0u8; 3];
            let count = reader.rx.lock().pop(&mut buf);
            reader.got.extend_from_slice(&buf[..count]);
            Transition::Handled
        }
        CONNECTED => {
            reader.peer_connected = true;
            Transition::Handled
        }
        _ => Transition::Unhandled,
    }
}

#[derive(Default)]
struct Writer {
    space_events: u32,
}

fn writing(_: &mut Context<'_, '_>, writer: &mut Writer, evt: Event) -> Transition<Writer> {
    match evt {
        RX_SPACE => {
            writer.space_events += 1;
            Transition::Handled
        }
        _ => Transition::Unhandled,
    }
}

static READING: State<Reader> = State::new("reading", reading);
static WRITING: State<Writer> = State::new("writing", writing);

/// Bytes pushed by the producer reach the consumer machine through the
/// pending-event path, and the producer hears about freed space once.
#[test]
fn test_stream_pair_carries_at_command() {
    let mailbox: &'static Mailbox = leak(Mailbox::new());
    let rx: &'static Pipe = leak(SharedStream::new());
    let tx: &'static Pipe = leak(SharedStream::new());

    let mut reader = Machine::new(
        &READING,
        Reader {
            rx,
            got: Vec::new(),
            peer_connected: false,
        },
    );
    let mut writer = Machine::new(&WRITING, Writer::default());
    let mut kernel = Kernel::new(mailbox);
    let reader_id = kernel.register(&mut reader).unwrap();
    let writer_id = kernel.register(&mut writer).unwrap();

    {
        let mut stream = rx.lock();
        stream.init();
        stream.set_consumer(Some(leak(EventNotify::new(
            mailbox,
            reader_id,
            Some(RX_DATA),
            Some(CONNECTED),
        ))));
        stream.set_producer(Some(leak(EventNotify::new(
            mailbox,
            writer_id,
            Some(RX_SPACE),
            None,
        ))));
    }
    tx.lock().init();
    kernel.init(reader_id, true).unwrap();
    kernel.init(writer_id, true).unwrap();

    assert_eq!(rx.lock().free_size(), 65);
    assert_eq!(tx.lock().free_size(), 65);

    assert!(!rx.lock().connect_rx());
    assert!(rx.lock().connect_tx());
    assert!(!tx.lock().connect_rx());
    assert!(tx.lock().connect_tx());

    assert_eq!(rx.lock().push(b"AT\r"), 3);
    assert_eq!(rx.lock().data_size(), 3);
    assert!(mailbox.any_pending());

    // the reader pops before the writer's turn, so one pass covers both
    assert!(!kernel.poll());

    let reader = kernel.machine::<Machine<Reader>>(reader_id).unwrap().data();
    assert_eq!(reader.got, b"AT\r");
    assert!(reader.peer_connected);
    assert_eq!(rx.lock().data_size(), 0);
    assert!(!rx.lock().overflowed());

    let writer = kernel.machine::<Machine<Writer>>(writer_id).unwrap().data();
    assert_eq!(writer.space_events, 1);
    assert!(!mailbox.any_pending());
}

#[derive(Clone, Copy, Default)]
enum WorkerStep {
    #[default]
    Start,
    Enter,
    Hold,
}

struct Worker {
    tag: u8,
    lock: Option<SyncId>,
    log: Rc<RefCell<Vec<u8>>>,
}

fn worker(pt: &mut Pt<Worker, WorkerStep>, cx: &mut Context<'_, '_>, _: Event) -> PtStatus {
    let Some(lock) = pt.data.lock else {
        return PtStatus::Failed(SmError::InvalidParameter);
    };

    match pt.resume_point() {
        WorkerStep::Start => pt.wait_for(WorkerStep::Enter, GO),
        WorkerStep::Enter => match cx.critical_enter(lock) {
            Ok(Acquire::Acquired) => {
                pt.data.log.borrow_mut().push(pt.data.tag);
                pt.wait_for(WorkerStep::Hold, RELEASE)
            }
            Ok(Acquire::WouldBlock) => pt.wait_for(WorkerStep::Enter, WAKE),
            Err(err) => PtStatus::Failed(err),
        },
        WorkerStep::Hold => match cx.critical_leave(lock) {
            Ok(()) => PtStatus::Complete,
            Err(err) => PtStatus::Failed(err),
        },
    }
}

/// Three protothreads contend for one critical section and get it in the
/// order they asked for it.
#[test]
fn test_critical_section_is_fifo() {
    let mailbox = Mailbox::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut workers: Vec<_> = (0..3u8)
        .map(|tag| {
            Pt::new(
                worker,
                Worker {
                    tag,
                    lock: None,
                    log: Rc::clone(&log),
                },
            )
        })
        .collect();

    let mut kernel = Kernel::new(&mailbox);
    let lock = kernel.critical_init(WAKE).unwrap();
    let mut ids = Vec::new();
    for pt in workers.iter_mut() {
        pt.data.lock = Some(lock);
        ids.push(kernel.register(pt).unwrap());
    }
    for &id in &ids {
        kernel.init(id, true).unwrap();
        kernel.post_event(id, GO).unwrap();
    }

    kernel.poll();
    assert_eq!(*log.borrow(), [0]);
    assert_eq!(kernel.sync_object(lock).unwrap().waiting(), 2);

    for holder in 0..3 {
        kernel.post_event(ids[holder], RELEASE).unwrap();
        kernel.poll();
        assert!(!kernel.is_active(ids[holder]));
    }

    assert_eq!(*log.borrow(), [0, 1, 2]);
    assert_eq!(kernel.sync_object(lock).unwrap().counter(), 1);
    assert!(!mailbox.any_pending());
}

/// A waiting protothread that finishes early loses its place; the unit goes
/// to the next waiter.
#[test]
fn test_finished_waiter_hands_grant_on() {
    let mailbox = Mailbox::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut a = Pt::new(worker, Worker { tag: 0, lock: None, log: Rc::clone(&log) });
    let mut b = Pt::new(worker, Worker { tag: 1, lock: None, log: Rc::clone(&log) });
    let mut c = Pt::new(worker, Worker { tag: 2, lock: None, log: Rc::clone(&log) });

    let mut kernel = Kernel::new(&mailbox);
    let lock = kernel.critical_init(WAKE).unwrap();
    a.data.lock = Some(lock);
    b.data.lock = Some(lock);
    c.data.lock = Some(lock);
    let a = kernel.register(&mut a).unwrap();
    let b = kernel.register(&mut b).unwrap();
    let c = kernel.register(&mut c).unwrap();
    for id in [a, b, c] {
        kernel.init(id, true).unwrap();
        kernel.post_event(id, GO).unwrap();
    }
    kernel.poll();

    // b is granted the unit but released before consuming it
    kernel.post_event(a, RELEASE).unwrap();
    kernel.dispatch_pending(a).unwrap();
    kernel.release(b).unwrap();

    kernel.poll();
    assert_eq!(*log.borrow(), [0, 2]);
}

#[derive(Default)]
struct Session {
    removed: bool,
    seen: u32,
}

fn once(cx: &mut Context<'_, '_>, s: &mut Session, evt: Event) -> Transition<Session> {
    match evt {
        GO => {
            s.seen += 1;
            let this = cx.this();
            if cx.remove_subsm(Parent::Top, this).is_ok() {
                s.removed = true;
            }
            Transition::Handled
        }
        _ => Transition::Unhandled,
    }
}

static ONCE: State<Session> = State::new("once", once);

/// A machine detaching itself from the top list mid-pass does not stop its
/// siblings from running in the same pass.
#[test]
fn test_self_removal_is_deferred() {
    let mailbox = Mailbox::new();
    let mut first = Machine::new(&ONCE, Session::default());
    let mut second = Machine::new(&ONCE, Session::default());
    let mut kernel = Kernel::new(&mailbox);
    let first = kernel.register(&mut first).unwrap();
    let second = kernel.register(&mut second).unwrap();
    kernel.init(first, true).unwrap();
    kernel.init(second, true).unwrap();

    kernel.post_event(first, GO).unwrap();
    kernel.post_event(second, GO).unwrap();
    assert!(!kernel.poll());

    for id in [first, second] {
        assert_eq!(kernel.parent_of(id), Ok(None));
        let session = kernel.machine::<Machine<Session>>(id).unwrap().data();
        assert!(session.removed);
        assert_eq!(session.seen, 1);
    }

    // detached machines still get their pending work
    kernel.post_event(first, GO).unwrap();
    assert!(!kernel.poll());
    let session = kernel.machine::<Machine<Session>>(first).unwrap().data();
    assert_eq!(session.seen, 2);
    assert_eq!(kernel.parent_of(first), Ok(None));
}

#[derive(Default)]
struct Ticks {
    seen: u32,
}

fn counting(_: &mut Context<'_, '_>, t: &mut Ticks, evt: Event) -> Transition<Ticks> {
    match evt {
        TICK => {
            t.seen += 1;
            Transition::Handled
        }
        _ => Transition::Unhandled,
    }
}

static COUNTING: State<Ticks> = State::new("counting", counting);

/// A tick source on another thread feeds the machine only through the
/// mailbox.
#[test]
fn test_timer_ticks_from_another_thread() {
    let mailbox: &'static Mailbox = leak(Mailbox::new());
    let timers: Arc<TimerService<'static>> = Arc::new(TimerService::new(mailbox));

    let mut ticks = Machine::new(&COUNTING, Ticks::default());
    let mut kernel = Kernel::new(mailbox);
    let id = kernel.register(&mut ticks).unwrap();
    kernel.init(id, true).unwrap();
    timers.register(2, id, TICK).unwrap();

    let mut seen = 0;
    for _ in 0..5 {
        let source = Arc::clone(&timers);
        thread::spawn(move || {
            source.tick();
            source.tick();
        })
        .join()
        .unwrap();

        kernel.poll();
        seen += 1;
        assert_eq!(kernel.machine::<Machine<Ticks>>(id).unwrap().data().seen, seen);
    }
    assert_eq!(timers.ticks(), 10);
    assert_eq!(kernel.stats().posted_pending, 5);
}
