use std::{ffi::CString, io, os::unix::ffi::OsStrExt, path::Path};

use crate::engine::sandbox::{Enforcement, MemoryCap, SandboxConfig, SandboxRequest};

const MAX_OPEN_FILES: u64 = 64;
/// The waiter outside the PID namespace plus the namespace init.
const SUPERVISOR_PROCESSES: u64 = 2;

/// Kernel-level restrictions applied in the child between `fork` and `exec`.
#[derive(Debug, Clone)]
pub(super) struct IsolationPlan {
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub file_size_bytes: u64,
    /// `RLIMIT_NPROC` counts every process of the real uid, so it is only
    /// meaningful when runs switch to a dedicated identity.
    pub max_processes: Option<u64>,
    pub network: Enforcement,
    pub containment: Enforcement,
    pub filesystem: Enforcement,
    /// The one directory the run may create, modify or remove files in.
    pub writable_dir: CString,
}

impl IsolationPlan {
    pub fn for_request(
        request: &SandboxRequest,
        config: &SandboxConfig,
        writable_dir: &Path,
    ) -> io::Result<Self> {
        let limits = &request.limits;
        let supervisors = match config.containment {
            Enforcement::Disabled => 0,
            _ => SUPERVISOR_PROCESSES,
        };
        let writable_dir = CString::new(writable_dir.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "run directory contains a NUL byte")
        })?;
        Ok(Self {
            cpu_seconds: limits.cpu_seconds(),
            address_space_bytes: match request.memory_cap {
                MemoryCap::AddressSpace => Some(limits.memory_bytes()),
                MemoryCap::Resident => None,
            },
            file_size_bytes: limits.max_file_size_bytes,
            max_processes: config
                .run_as
                .is_some()
                .then(|| limits.max_processes.saturating_add(supervisors)),
            network: config.network,
            containment: config.containment,
            filesystem: config.filesystem,
            writable_dir,
        })
    }

    /// Must stay async-signal-safe: no allocation, no locks.
    ///
    /// With containment the calling process never returns from here; only
    /// the payload process at the bottom of the supervisor chain does.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> io::Result<()> {
        // SAFETY: plain syscalls on the calling (single-threaded, forked) process.
        unsafe {
            // New process group led by the child, so the whole tree can be
            // signalled with one killpg.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        set_parent_death_signal()?;
        // Before the supervisors fork; they re-raise the payload's fatal signal.
        set_limit(libc::RLIMIT_CORE, 0, 0)?;

        if self.filesystem != Enforcement::Disabled {
            let confined = confine_writes(&self.writable_dir);
            if self.filesystem == Enforcement::Required {
                confined?;
            }
        }
        self.enter_namespaces()?;

        set_limit(
            libc::RLIMIT_CPU,
            self.cpu_seconds,
            self.cpu_seconds.saturating_add(1),
        )?;
        if let Some(bytes) = self.address_space_bytes {
            set_limit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        set_limit(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        if let Some(count) = self.max_processes {
            set_limit(libc::RLIMIT_NPROC, count, count)?;
        }
        set_limit(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process sandbox requires linux",
        ))
    }

    /// Tries every wanted namespace at once, then drops the best-effort
    /// ones that are not required.
    #[cfg(target_os = "linux")]
    fn enter_namespaces(&self) -> io::Result<()> {
        let wanted = self.namespace_flags(|level| level != Enforcement::Disabled);
        if wanted == 0 {
            return Ok(());
        }
        let required = self.namespace_flags(|level| level == Enforcement::Required);
        let mut failure = None;
        for flags in [wanted, wanted & !PID_NAMESPACE, wanted & !libc::CLONE_NEWNET] {
            if flags == 0 || flags & required != required {
                continue;
            }
            match unshare_namespaces(flags) {
                Ok(()) if flags & libc::CLONE_NEWPID != 0 => return supervise(),
                Ok(()) => return Ok(()),
                Err(err) => failure = Some(err),
            }
        }
        match failure {
            Some(err) if required != 0 => Err(err),
            _ => Ok(()),
        }
    }

    #[cfg(target_os = "linux")]
    fn namespace_flags(&self, pick: impl Fn(Enforcement) -> bool) -> libc::c_int {
        let mut flags = 0;
        if pick(self.containment) {
            flags |= PID_NAMESPACE;
        }
        if pick(self.network) {
            flags |= libc::CLONE_NEWNET;
        }
        flags
    }
}

#[cfg(target_os = "linux")]
const PID_NAMESPACE: libc::c_int = libc::CLONE_NEWPID | libc::CLONE_NEWIPC;

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_PDEATHSIG,
            libc::SIGKILL as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_limit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Privileged callers can unshare directly; everyone else needs a user
/// namespace too. A fresh network namespace has only a downed loopback.
#[cfg(target_os = "linux")]
fn unshare_namespaces(flags: libc::c_int) -> io::Result<()> {
    // SAFETY: unshare only affects the calling process.
    unsafe {
        if libc::unshare(flags) == 0 {
            return Ok(());
        }
        if libc::unshare(flags | libc::CLONE_NEWUSER) == 0 {
            return Ok(());
        }
    }
    Err(io::Error::last_os_error())
}

/// Exit status relayed when the payload's real status was lost.
#[cfg(target_os = "linux")]
const LOST_STATUS: libc::c_int = 127 << 8;
#[cfg(target_os = "linux")]
const FALLBACK_FD_CEILING: libc::c_int = 65_536;

/// Splits the child into three processes after `unshare(CLONE_NEWPID)`.
///
/// The calling process stays outside the namespace and mirrors the
/// payload's exit status, so the service still waits on the pid it spawned.
/// Its child becomes the namespace init and reaps everything. The
/// grandchild returns `Ok` and goes on to exec the payload. When the init
/// exits the kernel kills whatever is left in the namespace, including
/// processes that called `setsid` or double-forked.
#[cfg(target_os = "linux")]
fn supervise() -> io::Result<()> {
    let mut status_pipe = [0 as libc::c_int; 2];
    // SAFETY: fork/wait/pipe syscalls in a single-threaded child. The
    // supervisor branches only touch their own stack and `_exit`.
    unsafe {
        for signal in [libc::SIGCHLD, libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT] {
            libc::signal(signal, libc::SIG_DFL);
        }
        if libc::pipe2(status_pipe.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
            return Err(io::Error::last_os_error());
        }
        let [status_read, status_write] = status_pipe;
        match libc::fork() {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                libc::close(status_read);
                set_parent_death_signal()?;
                match libc::fork() {
                    -1 => Err(io::Error::last_os_error()),
                    0 => {
                        libc::close(status_write);
                        set_parent_death_signal()
                    }
                    payload => {
                        close_fds_except(status_write);
                        let status = reap_until(payload);
                        libc::write(
                            status_write,
                            (&raw const status).cast::<libc::c_void>(),
                            size_of::<libc::c_int>(),
                        );
                        libc::_exit(0)
                    }
                }
            }
            init => {
                close_fds_except(status_read);
                let init_status = wait_for(init);
                exit_like(read_status(status_read).unwrap_or(init_status))
            }
        }
    }
}

/// Supervisors must not hold the exec-error pipe or the stdio pipes, or the
/// service would wait on them instead of on the payload.
#[cfg(target_os = "linux")]
fn close_fds_except(keep: libc::c_int) {
    let keep = keep as libc::c_uint;
    // SAFETY: closing descriptors of the calling process only.
    unsafe {
        let below = keep == 0
            || libc::syscall(libc::SYS_close_range, 0 as libc::c_uint, keep - 1, 0 as libc::c_uint) == 0;
        let above = libc::syscall(
            libc::SYS_close_range,
            keep.saturating_add(1),
            libc::c_uint::MAX,
            0 as libc::c_uint,
        ) == 0;
        if !(below && above) {
            for fd in 0..FALLBACK_FD_CEILING {
                if fd as libc::c_uint != keep {
                    libc::close(fd);
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn interrupted() -> bool {
    io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

/// Namespace init loop: reaps orphans until the payload itself exits.
#[cfg(target_os = "linux")]
fn reap_until(payload: libc::pid_t) -> libc::c_int {
    loop {
        let mut status = 0;
        // SAFETY: `status` outlives the call.
        let reaped = unsafe { libc::waitpid(-1, &mut status, 0) };
        if reaped == payload {
            return status;
        }
        if reaped < 0 && !interrupted() {
            return LOST_STATUS;
        }
    }
}

#[cfg(target_os = "linux")]
fn wait_for(pid: libc::pid_t) -> libc::c_int {
    loop {
        let mut status = 0;
        // SAFETY: `status` outlives the call.
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        if reaped == pid {
            return status;
        }
        if reaped < 0 && !interrupted() {
            return LOST_STATUS;
        }
    }
}

#[cfg(target_os = "linux")]
fn read_status(fd: libc::c_int) -> Option<libc::c_int> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: reads at most `size_of::<c_int>()` bytes into `status`.
        let read = unsafe {
            libc::read(
                fd,
                (&raw mut status).cast::<libc::c_void>(),
                size_of::<libc::c_int>(),
            )
        };
        if read == size_of::<libc::c_int>() as isize {
            return Some(status);
        }
        if read < 0 && interrupted() {
            continue;
        }
        return None;
    }
}

/// Terminates the calling process the same way the payload terminated.
#[cfg(target_os = "linux")]
fn exit_like(status: libc::c_int) -> ! {
    // SAFETY: signal and exit syscalls on the calling process.
    unsafe {
        if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            libc::signal(signal, libc::SIG_DFL);
            let mut unblock: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut unblock);
            libc::sigaddset(&mut unblock, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &unblock, std::ptr::null_mut());
            libc::kill(libc::getpid(), signal);
            libc::_exit(128 + signal);
        }
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }
        libc::_exit(127)
    }
}

#[cfg(target_os = "linux")]
const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1;
#[cfg(target_os = "linux")]
const LANDLOCK_RULE_PATH_BENEATH: libc::c_int = 1;

#[cfg(target_os = "linux")]
mod access {
    pub const WRITE_FILE: u64 = 1 << 1;
    pub const REMOVE_DIR: u64 = 1 << 4;
    pub const REMOVE_FILE: u64 = 1 << 5;
    pub const MAKE_CHAR: u64 = 1 << 6;
    pub const MAKE_DIR: u64 = 1 << 7;
    pub const MAKE_REG: u64 = 1 << 8;
    pub const MAKE_SOCK: u64 = 1 << 9;
    pub const MAKE_FIFO: u64 = 1 << 10;
    pub const MAKE_BLOCK: u64 = 1 << 11;
    pub const MAKE_SYM: u64 = 1 << 12;
    /// ABI 2.
    pub const REFER: u64 = 1 << 13;
    /// ABI 3.
    pub const TRUNCATE: u64 = 1 << 14;

    pub const MODIFY: u64 = WRITE_FILE
        | REMOVE_DIR
        | REMOVE_FILE
        | MAKE_CHAR
        | MAKE_DIR
        | MAKE_REG
        | MAKE_SOCK
        | MAKE_FIFO
        | MAKE_BLOCK
        | MAKE_SYM;
}

#[cfg(target_os = "linux")]
#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
}

#[cfg(target_os = "linux")]
#[repr(C, packed)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: i32,
}

/// Landlock ABI version of the running kernel, `None` without Landlock.
#[cfg(target_os = "linux")]
pub(crate) fn landlock_abi() -> Option<i64> {
    // SAFETY: the version query takes no attribute and no size.
    let abi = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<RulesetAttr>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    (abi > 0).then_some(i64::from(abi))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn landlock_abi() -> Option<i64> {
    None
}

/// Reading stays unrestricted; creating, modifying and removing files is
/// only allowed beneath `writable_dir` (plus writing to `/dev/null`).
#[cfg(target_os = "linux")]
fn confine_writes(writable_dir: &std::ffi::CStr) -> io::Result<()> {
    let abi = landlock_abi().ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSYS))?;
    let mut handled = access::MODIFY;
    if abi >= 2 {
        handled |= access::REFER;
    }
    if abi >= 3 {
        handled |= access::TRUNCATE;
    }
    let attr = RulesetAttr {
        handled_access_fs: handled,
    };
    // SAFETY: `attr` is a valid ruleset attribute of the size passed.
    let ruleset = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            &raw const attr,
            size_of::<RulesetAttr>(),
            0 as libc::c_uint,
        )
    };
    if ruleset < 0 {
        return Err(io::Error::last_os_error());
    }
    let ruleset = ruleset as libc::c_int;
    let null_device = access::WRITE_FILE | (handled & access::TRUNCATE);
    let result = allow_beneath(ruleset, writable_dir, handled)
        .and_then(|()| allow_beneath(ruleset, c"/dev/null", null_device))
        .and_then(|()| {
            // SAFETY: `ruleset` is an open Landlock ruleset descriptor.
            if unsafe { libc::syscall(libc::SYS_landlock_restrict_self, ruleset, 0 as libc::c_uint) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    // SAFETY: closes the descriptor created above.
    unsafe { libc::close(ruleset) };
    result
}

#[cfg(target_os = "linux")]
fn allow_beneath(ruleset: libc::c_int, path: &std::ffi::CStr, allowed: u64) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated; O_PATH opens without access rights.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let rule = PathBeneathAttr {
        allowed_access: allowed,
        parent_fd: fd,
    };
    // SAFETY: `rule` is a valid path-beneath attribute for the call.
    let added = unsafe {
        libc::syscall(
            libc::SYS_landlock_add_rule,
            ruleset,
            LANDLOCK_RULE_PATH_BENEATH,
            &raw const rule,
            0 as libc::c_uint,
        )
    };
    let result = if added != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    };
    // SAFETY: closes the descriptor opened above.
    unsafe { libc::close(fd) };
    result
}
