// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::*;
use crate::test_util::{ManualScheduler, trace_init};
use crate::{StopSource, schedule_on};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

#[test]
fn lazy_until_started() {
    let _trace = trace_init();
    let ran = Arc::new(AtomicBool::new(false));

    let task = Task::new({
        let ran = ran.clone();
        async move {
            ran.store(true, Ordering::Release);
            1
        }
    });
    assert!(!task.is_started());
    assert!(!ran.load(Ordering::Acquire));

    task.start();
    task.start();
    assert!(task.is_started());
    assert!(ran.load(Ordering::Acquire));
    assert_eq!(task.try_result(), Some(1));
}

#[test]
fn dropping_unstarted_task_never_runs_it() {
    let ran = Arc::new(AtomicBool::new(false));
    drop(Task::new({
        let ran = ran.clone();
        async move { ran.store(true, Ordering::Release) }
    }));
    assert!(!ran.load(Ordering::Acquire));
}

#[test]
fn then_after_completion_runs_inline() {
    let task = Task::new(async { 42 });
    task.start();
    assert!(task.is_complete());

    let (tx, rx) = mpsc::channel();
    let caller = thread::current().id();
    task.then(move |value| tx.send((*value, thread::current().id())).unwrap());

    // must have fired already, on this thread
    assert_eq!(rx.try_recv().unwrap(), (42, caller));
    assert!(rx.try_recv().is_err());
}

#[test]
fn then_before_completion_fires_once_on_completing_thread() {
    let scheduler = Arc::new(ManualScheduler::default());
    let task = Task::new({
        let scheduler = scheduler.clone();
        async move {
            schedule_on(&*scheduler, 0).await;
            String::from("done")
        }
    });
    task.start();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    task.then({
        let calls = calls.clone();
        move |value: &String| {
            calls.fetch_add(1, Ordering::Relaxed);
            tx.send((value.clone(), thread::current().id())).unwrap();
        }
    });
    assert!(rx.try_recv().is_err());

    let (handle, _) = scheduler.take_one();
    let resumer = thread::spawn(move || {
        handle.resume();
        thread::current().id()
    });
    let resumer = resumer.join().unwrap();

    assert_eq!(rx.recv().unwrap(), (String::from("done"), resumer));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(task.get_result(), "done");
}

#[test]
fn callbacks_outlive_the_task_handle() {
    let scheduler = Arc::new(ManualScheduler::default());
    let task = Task::new({
        let scheduler = scheduler.clone();
        async move {
            schedule_on(&*scheduler, 0).await;
            7
        }
    });
    task.start();

    let (tx, rx) = mpsc::channel();
    task.then(move |value| tx.send(*value).unwrap());
    drop(task);

    let (handle, _) = scheduler.take_one();
    handle.resume();
    assert_eq!(rx.recv().unwrap(), 7);
}

#[test]
fn await_nested_task() {
    let scheduler = Arc::new(ManualScheduler::default());

    let child = Task::new({
        let scheduler = scheduler.clone();
        async move {
            schedule_on(&*scheduler, 1).await;
            vec![1, 2, 3]
        }
    });
    let parent = Task::new(async move {
        let items = child.await;
        items.iter().sum::<i32>()
    });

    parent.start();
    assert!(!parent.is_complete());
    assert_eq!(scheduler.len(), 1);

    let (handle, args) = scheduler.take_one();
    assert_eq!(args, 1);
    thread::spawn(move || handle.resume()).join().unwrap();

    assert_eq!(parent.get_result(), 6);
}

#[test]
fn await_completed_task() {
    let child = Task::new(async { 5 });
    child.start();

    let parent = Task::new(async move { child.await * 2 });
    assert_eq!(parent.into_result(), 10);
}

#[test]
fn get_result_starts_and_blocks() {
    let scheduler = Arc::new(ManualScheduler::default());
    let task = Arc::new(Task::new({
        let scheduler = scheduler.clone();
        async move {
            schedule_on(&*scheduler, 0).await;
            99_u64
        }
    }));

    let waiter = thread::spawn({
        let task = task.clone();
        move || task.get_result()
    });

    while scheduler.len() == 0 {
        thread::yield_now();
    }
    let (handle, _) = scheduler.take_one();
    handle.resume();

    assert_eq!(waiter.join().unwrap(), 99);
    assert_eq!(task.with_result(|v| *v + 1), 100);
}

#[test]
fn wait_for_times_out_on_suspended_task() {
    let scheduler = Arc::new(ManualScheduler::default());
    let task = Task::new({
        let scheduler = scheduler.clone();
        async move { schedule_on(&*scheduler, 0).await }
    });

    assert!(!task.wait_for(Duration::from_millis(10)));
    scheduler.take_one().0.resume();
    assert!(task.wait_for(Duration::from_millis(10)));
}

#[test]
fn stop_token_is_visible_to_the_body() {
    let source = StopSource::new();
    let task = launch(
        Task::new(async { (stop_requested(), current_stop_token().stop_possible()) }),
        source.token(),
    );
    assert_eq!(task.get_result(), (false, true));

    source.request_stop();
    let task = launch(Task::new(async { stop_requested() }), source.token());
    assert!(task.get_result());

    // outside of any task the current token never stops
    assert!(!stop_requested());
}

#[test]
fn cancellation_does_not_propagate() {
    let scheduler = Arc::new(ManualScheduler::default());
    let source = StopSource::new();

    // the body never looks at its token, so requesting a stop changes nothing
    let task = Task::new({
        let scheduler = scheduler.clone();
        async move {
            schedule_on(&*scheduler, 0).await;
            "finished"
        }
    });
    let task = launch(task, source.token());

    let (tx, rx) = mpsc::channel();
    task.then(move |value| tx.send(*value).unwrap());

    assert!(source.request_stop());
    scheduler.take_one().0.resume();

    assert_eq!(rx.recv().unwrap(), "finished");
    assert_eq!(task.get_result(), "finished");
}

#[test]
fn cooperative_cancellation() {
    let scheduler = Arc::new(ManualScheduler::default());
    let source = StopSource::new();

    let task = Task::new({
        let scheduler = scheduler.clone();
        async move {
            let mut steps = 0;
            while !stop_requested() {
                schedule_on(&*scheduler, 0).await;
                steps += 1;
            }
            steps
        }
    });
    let task = launch(task, source.token());

    scheduler.take_one().0.resume();
    scheduler.take_one().0.resume();
    source.request_stop();
    scheduler.take_one().0.resume();

    assert_eq!(task.get_result(), 3);
}

#[test]
fn stop_token_of_nested_task_is_restored() {
    let outer = StopSource::new();
    let inner = StopSource::new();
    inner.request_stop();

    // started from within the parent's poll, so its token has to be swapped in and out
    let child = Task::new(async { stop_requested() });
    child.set_stop_token(inner.token());
    let parent = Task::new(async move {
        let child_saw = child.await;
        (child_saw, stop_requested())
    });
    let parent = launch(parent, outer.token());

    assert_eq!(parent.get_result(), (true, false));
}

#[test]
fn builder_names_task() {
    let task = Task::<u8>::builder().name("answer").build(async { 42_u8 });
    assert!(task.id().as_u64() > 0);
    assert_eq!(task.get_result(), 42);
}
