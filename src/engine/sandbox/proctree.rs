use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    path::Path,
    sync::OnceLock,
};

/// Upper bound on processes followed per run.
const MAX_TRACKED: usize = 4096;
/// Each pass stops whatever was forked since the previous one.
const STOP_PASSES: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct ResourceSample {
    pub rss_kb: u64,
    pub peak_rss_kb: u64,
    pub cpu_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcEntry {
    cpu_ticks: u64,
    rss_kb: u64,
    hwm_kb: u64,
    /// Number of PID namespaces the process is visible in.
    ns_depth: usize,
    /// Pid inside its innermost namespace.
    ns_pid: u32,
}

/// Samples the whole process tree under the spawned child, not just the
/// child itself, so forked helpers count against the run's limits.
pub(super) struct TreeSampler {
    root: u32,
    /// Sticky once a PID namespace was seen under the root, so the
    /// supervisors stay excluded while the tree winds down.
    contained: bool,
}

impl TreeSampler {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            contained: false,
        }
    }

    /// `None` once the root has been reaped.
    pub async fn sample(&mut self) -> Option<ResourceSample> {
        let root = self.root;
        let entries = tokio::task::spawn_blocking(move || read_tree(root))
            .await
            .ok()?;
        if entries.is_empty() {
            return None;
        }
        let host_depth = own_namespace_depth();
        self.contained |= entries.iter().any(|entry| entry.ns_depth > host_depth);
        Some(summarize(&entries, host_depth, self.contained))
    }
}

/// CPU is summed over everything. Memory skips the supervisors, which are
/// forks of the service and would otherwise charge its pages to the run.
fn summarize(entries: &[ProcEntry], host_depth: usize, contained: bool) -> ResourceSample {
    let mut ticks = 0u64;
    let mut sample = ResourceSample::default();
    for entry in entries {
        ticks = ticks.saturating_add(entry.cpu_ticks);
        let supervisor = contained && (entry.ns_depth <= host_depth || entry.ns_pid == 1);
        if supervisor {
            continue;
        }
        sample.rss_kb += entry.rss_kb;
        sample.peak_rss_kb += entry.hwm_kb.max(entry.rss_kb);
    }
    sample.cpu_time_ms = ticks.saturating_mul(1000) / clock_ticks_per_sec();
    sample
}

fn read_tree(root: u32) -> Vec<ProcEntry> {
    process_tree(root).into_iter().filter_map(read_entry).collect()
}

fn read_entry(pid: u32) -> Option<ProcEntry> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (rss_kb, hwm_kb) = parse_status_memory(&status);
    let ns_pids = parse_namespace_pids(&status);
    Some(ProcEntry {
        cpu_ticks: parse_stat_cpu_ticks(&stat).unwrap_or(0),
        rss_kb,
        hwm_kb,
        ns_depth: ns_pids.len().max(1),
        ns_pid: ns_pids.last().copied().unwrap_or(pid),
    })
}

/// `root` followed by its descendants, breadth first. Empty once `root`
/// is gone from procfs.
fn process_tree(root: u32) -> Vec<u32> {
    if !Path::new(&format!("/proc/{root}")).exists() {
        return Vec::new();
    }
    let parents = (!Path::new(&format!("/proc/{root}/task/{root}/children")).exists())
        .then(parent_map);
    let mut tree = vec![root];
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        let children = match &parents {
            Some(map) => map.get(&pid).cloned().unwrap_or_default(),
            None => children_of(pid),
        };
        for child in children {
            if tree.len() >= MAX_TRACKED {
                return tree;
            }
            if seen.insert(child) {
                tree.push(child);
                queue.push_back(child);
            }
        }
    }
    tree
}

fn children_of(pid: u32) -> Vec<u32> {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .flatten()
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|list| {
            list.split_whitespace()
                .filter_map(|pid| pid.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}

/// Full procfs scan, for kernels built without the `children` file.
fn parent_map() -> HashMap<u32, Vec<u32>> {
    let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return map;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        let Some(ppid) = fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| parse_stat_parent(&stat))
        else {
            continue;
        };
        map.entry(ppid).or_default().push(pid);
    }
    map
}

/// SIGSTOPs `root` and every descendant, repeating until no new process
/// shows up, and returns them all. Stopped processes cannot fork or exit,
/// so the pids stay valid until the caller kills them.
pub(super) fn stop_tree(root: u32) -> Vec<u32> {
    let mut stopped: Vec<u32> = Vec::new();
    for _ in 0..STOP_PASSES {
        let fresh: Vec<u32> = process_tree(root)
            .into_iter()
            .filter(|pid| !stopped.contains(pid))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for pid in &fresh {
            // SAFETY: kill has no memory preconditions.
            unsafe { libc::kill(*pid as libc::pid_t, libc::SIGSTOP) };
        }
        stopped.extend(fresh);
    }
    stopped
}

fn own_namespace_depth() -> usize {
    static DEPTH: OnceLock<usize> = OnceLock::new();
    *DEPTH.get_or_init(|| {
        fs::read_to_string("/proc/self/status")
            .map(|status| parse_namespace_pids(&status).len().max(1))
            .unwrap_or(1)
    })
}

fn parse_status_memory(status: &str) -> (u64, u64) {
    let mut rss = 0;
    let mut hwm = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            hwm = parse_kb(rest);
        }
    }
    (rss, hwm)
}

/// `NSpid:` lists the pid from the outermost namespace inwards.
fn parse_namespace_pids(status: &str) -> Vec<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .map(|rest| rest.split_whitespace().filter_map(|pid| pid.parse().ok()).collect())
        .unwrap_or_default()
}

fn parse_kb(field: &str) -> u64 {
    field
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    Some(after_comm.split_whitespace().collect())
}

fn parse_stat_parent(stat: &str) -> Option<u32> {
    stat_fields(stat)?.get(1)?.parse().ok()
}

/// utime + stime of the process plus cutime + cstime of its reaped children.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let fields = stat_fields(stat)?;
    let mut ticks = 0u64;
    for index in 11..=14 {
        let value: u64 = fields.get(index)?.parse().ok()?;
        ticks = ticks.saturating_add(value);
    }
    Some(ticks)
}

fn clock_ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 { ticks as u64 } else { 100 }
    })
}

#[cfg(test)]
mod tests {
    use std::{process::Command, time::Duration};

    use super::{
        ProcEntry, parse_namespace_pids, parse_stat_cpu_ticks, parse_stat_parent,
        parse_status_memory, process_tree, stop_tree, summarize,
    };

    fn entry(ns_depth: usize, ns_pid: u32, rss_kb: u64, cpu_ticks: u64) -> ProcEntry {
        ProcEntry {
            cpu_ticks,
            rss_kb,
            hwm_kb: rss_kb,
            ns_depth,
            ns_pid,
        }
    }

    #[test]
    fn parses_resident_memory_fields() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmHWM:\t    9120 kB\nVmRSS:\t    8800 kB\n";
        assert_eq!(parse_status_memory(status), (8800, 9120));
    }

    #[test]
    fn parses_cpu_ticks_with_hostile_comm() {
        let stat = "4242 (a) b (c) S 1 4242 4242 0 -1 4194560 100 0 0 0 37 5 3 1 20 0 1 0 100 0 0";
        assert_eq!(parse_stat_cpu_ticks(stat), Some(46));
        assert_eq!(parse_stat_parent(stat), Some(1));
    }

    #[test]
    fn truncated_stat_yields_none() {
        assert_eq!(parse_stat_cpu_ticks("12 (x) S 1 2"), None);
    }

    #[test]
    fn namespace_pids_run_outermost_first() {
        let status = "Name:\tsh\nNSpid:\t81234\t2\nVmRSS:\t 100 kB\n";
        assert_eq!(parse_namespace_pids(status), vec![81234, 2]);
        assert!(parse_namespace_pids("Name:\tsh\n").is_empty());
    }

    #[test]
    fn supervisors_do_not_count_towards_memory() {
        let entries = [
            entry(1, 500, 40_000, 0),
            entry(2, 1, 40_000, 1),
            entry(2, 2, 3_000, 10),
            entry(2, 3, 1_000, 5),
        ];
        let sample = summarize(&entries, 1, true);
        assert_eq!(sample.rss_kb, 4_000);
        assert_eq!(sample.peak_rss_kb, 4_000);
        assert!(sample.cpu_time_ms > 0);

        let bare = summarize(&entries[..1], 1, false);
        assert_eq!(bare.rss_kb, 40_000);
    }

    #[test]
    fn tree_includes_forked_children() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let tree = process_tree(std::process::id());
        assert_eq!(tree[0], std::process::id());
        assert!(tree.contains(&child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn stop_tree_catches_grandchildren() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 5 & wait"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let stopped = stop_tree(child.id());
        assert!(stopped.len() >= 2, "{stopped:?}");
        for pid in &stopped {
            // SAFETY: test-owned processes.
            unsafe { libc::kill(*pid as libc::pid_t, libc::SIGKILL) };
        }
        child.wait().unwrap();
    }
}
