/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use ptio_rs::system::{EventLoop, Timer};
use ptio_rs::Error;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
struct Ping(u32);

#[test]
fn periodic_timer_fires_until_stopped() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let timer = Timer::new();
    timer.attach(&event_loop).unwrap();

    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    let _subscription = timer.timeout().connect(move |timer: &Timer| {
        counter.set(counter.get() + 1);
        if counter.get() == 3 {
            timer.stop();
            timer.event_loop().unwrap().exit();
        }
    });

    let started = Instant::now();
    timer.start(Duration::from_millis(10));
    event_loop.run().unwrap();

    assert_eq!(count.get(), 3);
    assert!(!timer.is_active());
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn one_shot_timer_fires_once() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let one_shot = Timer::new();
    let deadline = Timer::new();
    one_shot.attach(&event_loop).unwrap();
    deadline.attach(&event_loop).unwrap();

    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    let _fired = one_shot.timeout().connect(move |_: &Timer| counter.set(counter.get() + 1));
    let _stop = deadline.timeout().connect(|timer: &Timer| timer.event_loop().unwrap().exit());

    one_shot.start_after(Duration::from_millis(5), Duration::ZERO);
    deadline.start(Duration::from_millis(80));
    event_loop.run().unwrap();

    assert_eq!(count.get(), 1);
    assert!(!one_shot.is_active());
}

#[test]
fn timers_fire_in_expiry_order() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let timers: Vec<Timer> = (0..3).map(|_| Timer::new()).collect();
    let mut subscriptions = Vec::new();
    for (index, timer) in timers.iter().enumerate() {
        timer.attach(&event_loop).unwrap();
        let order = order.clone();
        subscriptions.push(timer.timeout().connect(move |timer: &Timer| {
            order.borrow_mut().push(index);
            if index == 0 {
                timer.event_loop().unwrap().exit();
            }
        }));
    }

    timers[0].start_after(Duration::from_millis(60), Duration::ZERO);
    timers[1].start_after(Duration::from_millis(20), Duration::ZERO);
    timers[2].start_after(Duration::from_millis(40), Duration::ZERO);
    event_loop.run().unwrap();

    assert_eq!(*order.borrow(), vec![1, 2, 0]);
}

#[test]
fn events_from_other_threads_are_delivered() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));

    let sink = received.clone();
    let handle = event_loop.clone();
    let _subscription = event_loop.on_event(move |event: &Ping| {
        sink.borrow_mut().push(event.0);
        if event.0 == 3 {
            handle.exit();
        }
    });

    let controller = event_loop.controller();
    let worker = thread::spawn(move || {
        for value in 1..=3 {
            controller.push_event(&Ping(value));
            thread::sleep(Duration::from_millis(5));
        }
    });

    event_loop.run().unwrap();
    worker.join().unwrap();
    assert_eq!(*received.borrow(), vec![1, 2, 3]);
}

#[test]
fn controller_stops_the_loop() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let controller = event_loop.controller();

    let exited = Rc::new(Cell::new(false));
    let flag = exited.clone();
    let _subscription = event_loop.exited().connect(move |_: &EventLoop| flag.set(true));

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        controller.exit().unwrap();
    });

    event_loop.run().unwrap();
    worker.join().unwrap();
    assert!(exited.get());
    assert!(!event_loop.is_running());
}

#[test]
fn exit_requested_before_run_is_kept() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let controller = event_loop.controller();

    thread::spawn(move || controller.exit().unwrap()).join().unwrap();
    assert!(event_loop.is_exiting());

    let start = Instant::now();
    event_loop.run().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!event_loop.is_exiting());

    event_loop.exit();
    event_loop.run().unwrap();
    assert!(!event_loop.is_exiting());
}

#[test]
fn idle_signal_is_sent_when_nothing_happens() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    event_loop.set_idle_timeout(Some(Duration::from_millis(10)));

    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    let _subscription = event_loop.idle().connect(move |event_loop: &EventLoop| {
        counter.set(counter.get() + 1);
        if counter.get() == 2 {
            event_loop.exit();
        }
    });

    event_loop.run().unwrap();
    assert_eq!(count.get(), 2);
}

#[test]
fn run_is_not_reentrant() {
    init_logger();
    let event_loop = EventLoop::new().unwrap();
    let timer = Timer::new();
    timer.attach(&event_loop).unwrap();

    let nested = Rc::new(RefCell::new(None));
    let result = nested.clone();
    let _subscription = timer.timeout().connect(move |timer: &Timer| {
        let event_loop = timer.event_loop().unwrap();
        *result.borrow_mut() = Some(event_loop.run());
        event_loop.exit();
    });

    timer.start_after(Duration::ZERO, Duration::ZERO);
    event_loop.run().unwrap();
    assert!(matches!(nested.borrow().as_ref(), Some(Err(Error::Pending))));
}
