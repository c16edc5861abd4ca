use super::*;
use crate::context::OperatorContext;
use crate::pipeline::Pipeline;
use crate::settings::Settings;
use crate::state::InMemoryCheckpointStore;
use crate::testing::{test_context, PushSource, RecordingObserver};

/// Downstream observer that subscribes a recorder to every window it
/// receives.
struct WindowCollector<T> {
    windows: Mutex<Vec<(String, Arc<RecordingObserver<T>>)>>,
    completed: std::sync::atomic::AtomicBool,
}

impl<T: Clone + Send + 'static> WindowCollector<T> {
    fn new() -> Self {
        Self {
            windows: Mutex::new(Vec::new()),
            completed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn contents(&self) -> Vec<Vec<T>> {
        self.windows
            .lock()
            .iter()
            .map(|(_, recorder)| recorder.values())
            .collect()
    }

    fn window_count(&self) -> usize {
        self.windows.lock().len()
    }

    fn uris(&self) -> Vec<String> {
        self.windows
            .lock()
            .iter()
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    fn all_closed(&self) -> bool {
        self.windows
            .lock()
            .iter()
            .all(|(_, recorder)| recorder.is_completed())
    }
}

impl<T: Clone + Send + 'static> Observer<TunnelRef<T>> for WindowCollector<T> {
    fn on_next(&self, window: TunnelRef<T>) {
        let recorder = Arc::new(RecordingObserver::new());
        let _ = window.subject().subscribe_observer(recorder.clone());
        self.windows
            .lock()
            .push((window.uri().to_string(), recorder));
    }

    fn on_error(&self, _error: OperatorError) {}

    fn on_completed(&self) {
        self.completed
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

fn count_pipeline(
    context: OperatorContext,
    count: usize,
    skip: usize,
) -> (
    Arc<PushSource<i64>>,
    Arc<WindowCollector<i64>>,
    Pipeline,
) {
    let source = PushSource::<i64>::new();
    let window = WindowCount::with_skip(source.clone() as SubscribableRef<i64>, count, skip);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), context);
    pipeline.start().unwrap();
    (source, collector, pipeline)
}

// ==================== WindowCount Tests ====================

#[test]
fn test_window_count_partitions_contiguously() {
    let (_scheduler, context) = test_context();
    let (source, collector, _pipeline) = count_pipeline(context, 2, 2);

    source.push_all([1, 2, 3, 4, 5]);
    source.complete();

    assert_eq!(collector.contents(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert!(collector.all_closed());
    assert!(collector
        .completed
        .load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn test_window_count_overlapping_skip() {
    let (_scheduler, context) = test_context();
    let (source, collector, _pipeline) = count_pipeline(context, 3, 1);

    source.push_all([1, 2, 3, 4]);
    source.complete();

    assert_eq!(
        collector.contents(),
        vec![vec![1, 2, 3], vec![2, 3, 4], vec![3, 4], vec![4]]
    );
}

#[test]
fn test_window_uris_are_tunnel_addressed() {
    let (_scheduler, context) = test_context();
    let (source, collector, _pipeline) = count_pipeline(context, 2, 2);

    source.push(1);
    for uri in collector.uris() {
        assert!(uri.starts_with("rill://tunnel/window/"));
    }
}

#[test]
fn test_window_count_limit_fault() {
    let (_scheduler, context) = test_context();
    let context = context.with_settings(Settings::new().with(keys::MAX_WINDOW_COUNT, 2));
    let source = PushSource::<i64>::new();
    let window = WindowCount::with_skip(source.clone() as SubscribableRef<i64>, 10, 1);
    let observer = Arc::new(RecordingObserver::new());
    let pipeline = Pipeline::subscribe(&window, observer.clone(), context);
    pipeline.start().unwrap();

    // Every item opens another concurrent window; the third exceeds the
    // configured bound.
    source.push(1);
    source.push(2);
    source.push(3);

    assert!(matches!(
        observer.error(),
        Some(OperatorError::ResourceLimit { limit: 2, .. })
    ));
    assert_eq!(observer.terminal_count(), 1);
}

#[test]
fn test_collected_window_stops_being_fed() {
    let (_scheduler, context) = test_context();
    let environment = context.environment().clone();
    let (source, collector, _pipeline) = count_pipeline(context, 10, 10);

    source.push(1);
    let uri = collector.uris()[0].clone();
    assert!(environment.collect(&uri));
    source.push(2);

    // The collected window saw only the first item.
    assert_eq!(collector.contents(), vec![vec![1]]);
}

#[test]
fn test_window_resumes_through_shared_environment() {
    let (_scheduler, context) = test_context();
    let mut store = InMemoryCheckpointStore::new();
    let collector = Arc::new(WindowCollector::new());

    {
        let source = PushSource::<i64>::new();
        let window = WindowCount::new(source.clone() as SubscribableRef<i64>, 3);
        let pipeline = Pipeline::subscribe(&window, collector.clone(), context.clone());
        pipeline.start().unwrap();
        source.push(1);
        pipeline.checkpoint(&mut store).unwrap();
        pipeline.unload();
    }

    // Same environment: the open window's URI re-resolves and the
    // consumer's existing subscription keeps receiving.
    let source = PushSource::<i64>::new();
    let window = WindowCount::new(source.clone() as SubscribableRef<i64>, 3);
    let downstream = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, downstream.clone(), context);
    pipeline.restore(&store).unwrap();
    pipeline.start().unwrap();

    source.push(2);
    source.push(3);

    assert_eq!(collector.contents(), vec![vec![1, 2, 3]]);
    assert!(collector.all_closed());
    // The recovered incarnation did not re-emit the restored window.
    assert_eq!(downstream.window_count(), 0);
}

#[test]
fn test_window_unresolved_uri_dropped_silently() {
    let (_scheduler, context) = test_context();
    let mut store = InMemoryCheckpointStore::new();

    {
        let collector = Arc::new(WindowCollector::new());
        let source = PushSource::<i64>::new();
        let window = WindowCount::new(source.clone() as SubscribableRef<i64>, 2);
        let pipeline = Pipeline::subscribe(&window, collector.clone(), context.clone());
        pipeline.start().unwrap();
        source.push(1);
        pipeline.checkpoint(&mut store).unwrap();
        pipeline.unload();
    }

    // A fresh context has an empty environment: the persisted URI does
    // not resolve and the window is presumed collected.
    let (_scheduler2, fresh_context) = test_context();
    let source = PushSource::<i64>::new();
    let window = WindowCount::new(source.clone() as SubscribableRef<i64>, 2);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), fresh_context);
    pipeline.restore(&store).unwrap();
    pipeline.start().unwrap();

    // items_seen resumed at 1; the next window opens at the skip
    // boundary (item index 2).
    source.push(2);
    source.push(3);
    source.push(4);
    source.complete();

    assert_eq!(collector.contents(), vec![vec![3, 4]]);
}

// ==================== WindowTime Tests ====================

#[test]
fn test_window_time_closes_on_schedule() {
    let (scheduler, context) = test_context();
    let source = PushSource::<i64>::new();
    let window = WindowTime::new(source.clone() as SubscribableRef<i64>, 10);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), context);
    pipeline.start().unwrap();

    source.push(1);
    source.push(2);
    scheduler.advance_to(10);
    source.push(3);
    scheduler.advance_to(20);

    assert_eq!(collector.contents(), vec![vec![1, 2], vec![3], vec![]]);
}

#[test]
fn test_window_time_overlap() {
    let (scheduler, context) = test_context();
    let source = PushSource::<i64>::new();
    let window = WindowTime::with_shift(source.clone() as SubscribableRef<i64>, 20, 10);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), context);
    pipeline.start().unwrap();

    source.push(1);
    scheduler.advance_to(10);
    source.push(2);
    scheduler.advance_to(20);
    source.push(3);

    // Window A [0,20) = [1,2]; window B [10,30) sees 2 and 3.
    assert_eq!(
        collector.contents(),
        vec![vec![1, 2], vec![2, 3], vec![3]]
    );
}

// ==================== WindowFerry Tests ====================

#[test]
fn test_window_ferry_count_close_resets_timer() {
    let (scheduler, context) = test_context();
    let source = PushSource::<i64>::new();
    let window = WindowFerry::new(source.clone() as SubscribableRef<i64>, 10, 2);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), context);
    pipeline.start().unwrap();

    source.push(1);
    source.push(2);
    // Count trigger closed the first window and opened the second.
    assert_eq!(collector.window_count(), 2);

    // The stale deadline tick is discarded; the re-armed one closes the
    // second window at its own deadline.
    scheduler.advance_to(10);
    assert_eq!(collector.window_count(), 3);
    assert_eq!(collector.contents(), vec![vec![1, 2], vec![], vec![]]);
}

#[test]
fn test_window_ferry_completion_closes_current() {
    let (_scheduler, context) = test_context();
    let source = PushSource::<i64>::new();
    let window = WindowFerry::new(source.clone() as SubscribableRef<i64>, 10, 5);
    let collector = Arc::new(WindowCollector::new());
    let pipeline = Pipeline::subscribe(&window, collector.clone(), context);
    pipeline.start().unwrap();

    source.push(1);
    source.complete();

    assert_eq!(collector.contents(), vec![vec![1]]);
    assert!(collector.all_closed());
}
