//! Echo shell behind a simulated CDC serial transport.
//!
//! The transport machine plays the USB device side: after a pull-up delay it
//! connects, moves scripted host input into the receive stream one packet
//! per bus frame (pausing its OUT endpoint while the stream is full) and
//! prints whatever the shell writes to the transmit stream. The shell echoes
//! input and prints a prompt after every line; a background protothread
//! interleaves status lines, serialized with the shell through a critical
//! section. `SIGALRM` drives the tick.

use protosm::host::HostTick;
use protosm::{
    Acquire, Context, Event, EventNotify, Kernel, Machine, Mailbox, Pt, PtStatus, SharedStream,
    SmError, State, StreamListener, SyncId, TimerId, TimerService, Transition,
};
use std::io::Write;

const STREAM_SIZE: usize = 65;
const EP_SIZE: usize = 16;
const TICK_MS: u64 = 5;
const PULLUP_TICKS: u32 = 40;
const FRAME_TICKS: u32 = 1;
const STATUS_TICKS: u32 = 60;
const STATUS_LINES: u32 = 3;
const IDLE_FRAMES_BEFORE_EXIT: u32 = 100;

const FRAME: Event = Event::user(0);
const PULLUP_DONE: Event = Event::user(1);
const RX_DATA: Event = Event::user(2);
const RX_SPACE: Event = Event::user(3);
const RX_PEER: Event = Event::user(4);
const TX_DATA: Event = Event::user(5);
const TX_SPACE: Event = Event::user(6);
const SHELL_UP: Event = Event::user(7);
const OUTPUT_FREE: Event = Event::user(8);
const STATUS_DUE: Event = Event::user(9);

const SCRIPT: &[&[u8]] = &[
    b"AT\r",
    b"echo hello\r",
    b"a line that spans several packets on the bus\r",
];

type Pipe = SharedStream<'static, STREAM_SIZE>;

static MAILBOX: Mailbox = Mailbox::new();
static TIMERS: TimerService<'static> = TimerService::new(&MAILBOX);

extern "C" fn on_tick(_sig: i32) {
    TIMERS.tick();
}

struct Cdc {
    // host -> shell
    rx: &'static Pipe,
    // shell -> host
    tx: &'static Pipe,
    pullup: Option<TimerId>,
    frame: Option<TimerId>,
    line: usize,
    offset: usize,
    out_enabled: bool,
    in_enabled: bool,
    idle_frames: u32,
    received: Vec<u8>,
}

impl Cdc {
    fn new(rx: &'static Pipe, tx: &'static Pipe) -> Self {
        Cdc {
            rx,
            tx,
            pullup: None,
            frame: None,
            line: 0,
            offset: 0,
            out_enabled: false,
            in_enabled: false,
            idle_frames: 0,
            received: Vec::new(),
        }
    }

    fn finished(&self) -> bool {
        self.line == SCRIPT.len() && self.idle_frames > IDLE_FRAMES_BEFORE_EXIT
    }

    // OUT endpoint: one packet of host input per frame
    fn host_out(&mut self) {
        if !self.out_enabled || self.line >= SCRIPT.len() {
            return;
        }
        let rest = &SCRIPT[self.line][self.offset..];
        let packet = &rest[..rest.len().min(EP_SIZE)];

        let mut rx = self.rx.lock();
        if rx.free_size() < packet.len() {
            // NAK until the shell frees space
            self.out_enabled = false;
            return;
        }
        self.offset += rx.push(packet);
        if rx.free_size() < EP_SIZE {
            self.out_enabled = false;
        }
        drop(rx);

        if self.offset == SCRIPT[self.line].len() {
            self.line += 1;
            self.offset = 0;
        }
    }

    // IN endpoint: one packet of shell output per frame
    fn host_in(&mut self) {
        if !self.in_enabled {
            self.idle_frames += 1;
            return;
        }
        let mut packet = [0u8; EP_SIZE];
        let count = self.tx.lock().pop(&mut packet);
        if count == 0 {
            self.in_enabled = false;
            self.idle_frames += 1;
            return;
        }

        self.idle_frames = 0;
        self.received.extend_from_slice(&packet[..count]);
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&packet[..count]);
        let _ = stdout.flush();
    }
}

fn usb(_: &mut Context<'_, '_>, _: &mut Cdc, evt: Event) -> Transition<Cdc> {
    match evt {
        // frames before enumeration carry nothing
        FRAME => Transition::Handled,
        _ => Transition::Unhandled,
    }
}

fn detached(cx: &mut Context<'_, '_>, cdc: &mut Cdc, evt: Event) -> Transition<Cdc> {
    match evt {
        Event::INIT => {
            match TIMERS.register(PULLUP_TICKS, cx.this(), PULLUP_DONE) {
                Ok(timer) => cdc.pullup = Some(timer),
                Err(err) => eprintln!("[usb] pull-up timer: {}", err),
            }
            Transition::Handled
        }
        PULLUP_DONE => {
            if let Some(timer) = cdc.pullup.take() {
                let _ = TIMERS.unregister(timer);
            }
            Transition::To(&CONNECTED)
        }
        _ => Transition::Unhandled,
    }
}

fn connected(cx: &mut Context<'_, '_>, cdc: &mut Cdc, evt: Event) -> Transition<Cdc> {
    match evt {
        Event::ENTER => {
            println!("[usb] pull-up on, host enumerated");
            cdc.frame = TIMERS.register(FRAME_TICKS, cx.this(), FRAME).ok();
            cdc.rx.lock().connect_tx();
            if cdc.tx.lock().connect_rx() {
                println!("[usb] shell already attached");
            }
            cdc.out_enabled = true;
            Transition::Handled
        }
        Event::EXIT => {
            if let Some(timer) = cdc.frame.take() {
                let _ = TIMERS.unregister(timer);
            }
            Transition::Handled
        }
        FRAME => {
            cdc.host_out();
            cdc.host_in();
            Transition::Handled
        }
        RX_SPACE => {
            if !cdc.out_enabled && cdc.rx.lock().free_size() >= EP_SIZE {
                cdc.out_enabled = true;
            }
            Transition::Handled
        }
        TX_DATA => {
            cdc.in_enabled = true;
            Transition::Handled
        }
        SHELL_UP => {
            println!("[usb] shell attached");
            Transition::Handled
        }
        _ => Transition::Unhandled,
    }
}

static USB: State<Cdc> = State::new("usb", usb);
static DETACHED: State<Cdc> = State::with_parent("detached", detached, &USB);
static CONNECTED: State<Cdc> = State::with_parent("connected", connected, &USB);

/// Writes one buffer to the transmit stream while holding the output lock.
struct Printer {
    tx: &'static Pipe,
    output: Option<SyncId>,
    buf: Vec<u8>,
    pos: usize,
}

impl Printer {
    fn new(tx: &'static Pipe) -> Self {
        Printer {
            tx,
            output: None,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn load(&mut self, text: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(text);
        self.pos = 0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum PrintStep {
    #[default]
    Acquire,
    Write,
}

fn print(pt: &mut Pt<Printer, PrintStep>, cx: &mut Context<'_, '_>, _: Event) -> PtStatus {
    let Some(output) = pt.data.output else {
        return PtStatus::Failed(SmError::InvalidParameter);
    };

    loop {
        match pt.resume_point() {
            PrintStep::Acquire => match cx.critical_enter(output) {
                Ok(Acquire::Acquired) => pt.goto(PrintStep::Write),
                Ok(Acquire::WouldBlock) => return pt.wait_for(PrintStep::Acquire, OUTPUT_FREE),
                Err(err) => return PtStatus::Failed(err),
            },
            PrintStep::Write => {
                let printer = &mut pt.data;
                let written = {
                    let mut tx = printer.tx.lock();
                    let room = tx.free_size().min(printer.buf.len() - printer.pos);
                    tx.push(&printer.buf[printer.pos..printer.pos + room])
                };
                printer.pos += written;

                if printer.pos < printer.buf.len() {
                    return pt.wait_for(PrintStep::Write, TX_SPACE);
                }
                return match cx.critical_leave(output) {
                    Ok(()) => PtStatus::Complete,
                    Err(err) => PtStatus::Failed(err),
                };
            }
        }
    }
}

struct Shell {
    rx: &'static Pipe,
    tx: &'static Pipe,
    printer: Pt<Printer, PrintStep>,
    then: ShellStep,
}

#[derive(Debug, Clone, Copy, Default)]
enum ShellStep {
    #[default]
    Start,
    Greet,
    Read,
    Print,
}

impl Shell {
    fn new(rx: &'static Pipe, tx: &'static Pipe) -> Self {
        Shell {
            rx,
            tx,
            printer: Pt::new(print, Printer::new(tx)),
            then: ShellStep::Read,
        }
    }
}

fn shell(pt: &mut Pt<Shell, ShellStep>, cx: &mut Context<'_, '_>, evt: Event) -> PtStatus {
    loop {
        match pt.resume_point() {
            ShellStep::Start => {
                let host_ready = pt.data.rx.lock().connect_rx();
                pt.data.tx.lock().connect_tx();
                if !host_ready {
                    return pt.wait_for(ShellStep::Greet, RX_PEER);
                }
                pt.goto(ShellStep::Greet);
            }
            ShellStep::Greet => {
                pt.data.printer.data.load(b"protosm echo shell\n\r>>>");
                pt.data.printer.restart();
                pt.data.then = ShellStep::Read;
                pt.goto(ShellStep::Print);
            }
            ShellStep::Read => {
                let mut chunk = [0u8; EP_SIZE];
                let count = pt.data.rx.lock().pop(&mut chunk);
                if count == 0 {
                    return pt.wait_for(ShellStep::Read, RX_DATA);
                }

                let mut echo = Vec::with_capacity(count + 8);
                for &byte in &chunk[..count] {
                    if byte == b'\r' {
                        echo.extend_from_slice(b"\n\r>>>");
                    } else {
                        echo.push(byte);
                    }
                }
                pt.data.printer.data.load(&echo);
                pt.data.printer.restart();
                pt.data.then = ShellStep::Read;
                pt.goto(ShellStep::Print);
            }
            ShellStep::Print => {
                if let Some(status) = pt.data.printer.call(cx, evt) {
                    return status;
                }
                let next = pt.data.then;
                pt.goto(next);
            }
        }
    }
}

struct Status {
    timer: Option<TimerId>,
    lines: u32,
    printer: Pt<Printer, PrintStep>,
}

#[derive(Debug, Clone, Copy, Default)]
enum StatusStep {
    #[default]
    Start,
    Due,
    Print,
}

fn status(pt: &mut Pt<Status, StatusStep>, cx: &mut Context<'_, '_>, evt: Event) -> PtStatus {
    loop {
        match pt.resume_point() {
            StatusStep::Start => match TIMERS.register(STATUS_TICKS, cx.this(), STATUS_DUE) {
                Ok(timer) => {
                    pt.data.timer = Some(timer);
                    return pt.wait_for(StatusStep::Due, STATUS_DUE);
                }
                Err(err) => return PtStatus::Failed(err),
            },
            StatusStep::Due => {
                pt.data.lines += 1;
                let line = format!("\n\r[status] uptime {} ticks\n\r", TIMERS.ticks());
                pt.data.printer.data.load(line.as_bytes());
                pt.data.printer.restart();
                pt.goto(StatusStep::Print);
            }
            StatusStep::Print => {
                let done = match pt.data.printer.call(cx, evt) {
                    Some(PtStatus::Pending) => return PtStatus::Pending,
                    Some(failed) => failed,
                    None if pt.data.lines < STATUS_LINES => {
                        return pt.wait_for(StatusStep::Due, STATUS_DUE);
                    }
                    None => PtStatus::Complete,
                };
                if let Some(timer) = pt.data.timer.take() {
                    let _ = TIMERS.unregister(timer);
                }
                return done;
            }
        }
    }
}

/// Space on the transmit stream concerns every writer.
struct Writers([EventNotify<'static>; 2]);

impl StreamListener for Writers {
    fn on_transfer(&self) {
        for writer in &self.0 {
            writer.on_transfer();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rx: &'static Pipe = Box::leak(Box::new(SharedStream::new()));
    let tx: &'static Pipe = Box::leak(Box::new(SharedStream::new()));

    let mut cdc = Machine::new(&DETACHED, Cdc::new(rx, tx));
    let mut front = Pt::new(shell, Shell::new(rx, tx));
    let mut background = Pt::new(
        status,
        Status {
            timer: None,
            lines: 0,
            printer: Pt::new(print, Printer::new(tx)),
        },
    );

    let mut kernel = Kernel::new(&MAILBOX);
    let cdc_id = kernel.register(&mut cdc)?;
    let shell_id = kernel.register(&mut front)?;
    let status_id = kernel.register(&mut background)?;

    let output = kernel.critical_init(OUTPUT_FREE)?;
    kernel
        .machine_mut::<Pt<Shell, ShellStep>>(shell_id)?
        .data
        .printer
        .data
        .output = Some(output);
    kernel
        .machine_mut::<Pt<Status, StatusStep>>(status_id)?
        .data
        .printer
        .data
        .output = Some(output);

    {
        let mut rx = rx.lock();
        rx.init();
        rx.set_producer(Some(Box::leak(Box::new(EventNotify::new(
            &MAILBOX,
            cdc_id,
            Some(RX_SPACE),
            None,
        )))));
        rx.set_consumer(Some(Box::leak(Box::new(EventNotify::new(
            &MAILBOX,
            shell_id,
            Some(RX_DATA),
            Some(RX_PEER),
        )))));
    }
    {
        let mut tx = tx.lock();
        tx.init();
        tx.set_producer(Some(Box::leak(Box::new(Writers([
            EventNotify::new(&MAILBOX, shell_id, Some(TX_SPACE), None),
            EventNotify::new(&MAILBOX, status_id, Some(TX_SPACE), None),
        ])))));
        tx.set_consumer(Some(Box::leak(Box::new(EventNotify::new(
            &MAILBOX,
            cdc_id,
            Some(TX_DATA),
            Some(SHELL_UP),
        )))));
    }

    kernel.init(cdc_id, true)?;
    kernel.init(shell_id, true)?;
    kernel.init(status_id, true)?;

    let mut tick = unsafe { HostTick::start(on_tick, TICK_MS)? };
    loop {
        kernel.poll();

        let transport = kernel.machine::<Machine<Cdc>>(cdc_id)?;
        if transport.data().finished() && !kernel.is_active(status_id) {
            break;
        }
        tick.idle(&MAILBOX);
    }
    tick.stop();

    let transport = kernel.machine::<Machine<Cdc>>(cdc_id)?;
    println!();
    println!(
        "[usb] {} bytes sent to host, overflow: {}",
        transport.data().received.len(),
        rx.lock().overflowed() || tx.lock().overflowed()
    );
    println!("[kernel] {:?}", kernel.stats());
    Ok(())
}
