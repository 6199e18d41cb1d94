use super::*;

fn preload(name: &str) -> Task {
    Task::Preload {
        options: AppOptions::new(name),
    }
}

fn task_name(event_loop: &EventLoop, index: usize) -> String {
    match &event_loop.task_queue[index].task {
        Task::Preload { options } => options.name.clone(),
        other => format!("{other:?}"),
    }
}

#[test]
fn tasks_run_by_due_time_then_by_scheduling_order() {
    let mut event_loop = EventLoop::default();
    event_loop.schedule(5, preload("late"));
    event_loop.schedule(1, preload("first"));
    event_loop.schedule(1, preload("second"));

    let mut order = Vec::new();
    while let Some(index) = event_loop.next_task_index(None) {
        order.push(task_name(&event_loop, index));
        event_loop.task_queue.remove(index);
    }
    assert_eq!(order, vec!["first", "second", "late"]);
}

#[test]
fn due_limit_hides_future_tasks() {
    let mut event_loop = EventLoop::default();
    event_loop.now_ms = 10;
    event_loop.schedule(3, preload("soon"));
    assert_eq!(event_loop.task_queue[0].due_at, 13);
    assert_eq!(event_loop.next_task_index(Some(12)), None);
    assert_eq!(event_loop.next_task_index(Some(13)), Some(0));
}

#[test]
fn negative_delays_are_clamped_to_now() {
    let mut event_loop = EventLoop::default();
    event_loop.now_ms = 4;
    event_loop.schedule(-20, preload("now"));
    assert_eq!(event_loop.task_queue[0].due_at, 4);
}

#[test]
fn cancel_removes_queued_and_flags_running_tasks() {
    let mut event_loop = EventLoop::default();
    let kept = event_loop.schedule(0, preload("kept"));
    let dropped = event_loop.schedule(0, preload("dropped"));
    assert!(event_loop.cancel(dropped));
    assert!(!event_loop.cancel(dropped));
    assert_eq!(event_loop.task_queue.len(), 1);

    event_loop.running_task_id = Some(kept);
    event_loop.cancel(kept);
    assert!(event_loop.running_canceled);
    assert!(event_loop.task_queue.is_empty());
}
