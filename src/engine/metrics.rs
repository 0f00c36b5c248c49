use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    compile_errors_total: AtomicU64,
    internal_errors_total: AtomicU64,
    timed_out_total: AtomicU64,
    cancelled_total: AtomicU64,
    retried_total: AtomicU64,
    queue_depth: AtomicU64,
    in_flight: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        decrement(&self.queue_depth);
    }

    pub fn finished(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        decrement(&self.in_flight);
    }

    pub fn compile_error(&self) {
        self.compile_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn internal_error(&self) {
        self.internal_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out(&self) {
        self.timed_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retried_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE judge_submissions_total counter\n",
                "judge_submissions_total {}\n",
                "# TYPE judge_rejected_total counter\n",
                "judge_rejected_total {}\n",
                "# TYPE judge_started_total counter\n",
                "judge_started_total {}\n",
                "# TYPE judge_completed_total counter\n",
                "judge_completed_total {}\n",
                "# TYPE judge_compile_errors_total counter\n",
                "judge_compile_errors_total {}\n",
                "# TYPE judge_internal_errors_total counter\n",
                "judge_internal_errors_total {}\n",
                "# TYPE judge_timed_out_total counter\n",
                "judge_timed_out_total {}\n",
                "# TYPE judge_cancelled_total counter\n",
                "judge_cancelled_total {}\n",
                "# TYPE judge_retried_total counter\n",
                "judge_retried_total {}\n",
                "# TYPE judge_queue_depth gauge\n",
                "judge_queue_depth {}\n",
                "# TYPE judge_in_flight gauge\n",
                "judge_in_flight {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.rejected_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.compile_errors_total.load(Ordering::Relaxed),
            self.internal_errors_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.cancelled_total.load(Ordering::Relaxed),
            self.retried_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
            self.in_flight.load(Ordering::Relaxed),
        )
    }
}

fn decrement(gauge: &AtomicU64) {
    let mut current = gauge.load(Ordering::Relaxed);
    while current > 0 {
        match gauge.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
