//! Namespace sandboxes without a container engine.
//!
//! `create` prepares, on the host, a cgroup v2 group carrying the resource
//! limits and a read-only chroot tree with a size-bounded `/tmp`. The shell is
//! started by re-executing this binary as `sandterm enter`, which joins the
//! cgroup, clones into fresh namespaces, drops privileges and execs the shell.

use super::{NetworkMode, SandboxConfig, SandboxRuntime, ShellCommand, TERM};
use crate::error::RuntimeError;
use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execvpe, setgid, setgroups, sethostname, setuid, Gid, Pid, Uid};
use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

const CPU_PERIOD_US: u64 = 100_000;
const ROOT_TMPFS_OPTS: &str = "size=8M,mode=755";
const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Arguments of the hidden `enter` subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct EnterArgs {
    /// Prepared sandbox root to chroot into
    #[arg(long)]
    pub root: PathBuf,

    /// cgroup v2 directory to join before cloning
    #[arg(long)]
    pub cgroup: PathBuf,

    /// Keep the host network namespace
    #[arg(long)]
    pub share_network: bool,

    /// Shell and its arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IsolateRuntime {
    root_dir: PathBuf,
    cgroup_root: PathBuf,
    exe: PathBuf,
}

impl IsolateRuntime {
    /// `root_dir` holds one chroot tree per sandbox, `cgroup_root` one cgroup
    /// per sandbox. `exe` is the binary providing the `enter` subcommand.
    pub fn new(root_dir: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>, exe: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            cgroup_root: cgroup_root.into(),
            exe: exe.into(),
        }
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (self.root_dir.join(name), self.cgroup_root.join(name))
    }
}

#[async_trait]
impl SandboxRuntime for IsolateRuntime {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn create(&self, name: &str, config: &SandboxConfig) -> Result<(), RuntimeError> {
        let (rootfs, cgroup) = self.paths(name);
        let config = config.clone();
        debug!(sandbox = %name, image = %config.image, "isolate runtime ignores images, using host binaries");

        tokio::task::spawn_blocking(move || {
            let result = prepare_cgroup(&cgroup, &config)
                .and_then(|()| setup_rootfs(&rootfs, config.tmp_size_bytes));
            if result.is_err() {
                cleanup_rootfs(&rootfs);
                remove_cgroup(&cgroup);
            }
            result.map_err(RuntimeError::Setup)
        })
        .await
        .map_err(|e| RuntimeError::Join(e.to_string()))?
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let (rootfs, cgroup) = self.paths(name);
        tokio::task::spawn_blocking(move || {
            kill_cgroup(&cgroup);
            cleanup_rootfs(&rootfs);
            remove_cgroup(&cgroup);
            if rootfs.exists() {
                return Err(RuntimeError::Setup(format!(
                    "{} still present after cleanup",
                    rootfs.display()
                )));
            }
            Ok(())
        })
        .await
        .map_err(|e| RuntimeError::Join(e.to_string()))?
    }

    fn shell_command(&self, name: &str, config: &SandboxConfig, shell: &[String]) -> ShellCommand {
        let (rootfs, cgroup) = self.paths(name);
        let mut cmd = ShellCommand::new(self.exe.to_string_lossy())
            .arg("enter")
            .arg("--root")
            .arg(rootfs.to_string_lossy())
            .arg("--cgroup")
            .arg(cgroup.to_string_lossy());
        if config.network != NetworkMode::None {
            cmd = cmd.arg("--share-network");
        }
        cmd.arg("--")
            .args(shell.iter().cloned())
            .env("TERM", TERM)
            .env("PATH", SANDBOX_PATH)
            .env("HOME", "/tmp")
            .env("LANG", "C.UTF-8")
            .env("USER_ID", &config.user_id)
            .cwd("/")
    }
}

// ============================================================================
// Host-side preparation
// ============================================================================

fn prepare_cgroup(cgroup: &Path, config: &SandboxConfig) -> Result<(), String> {
    if let Some(parent) = cgroup.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
        // Controllers must be delegated down to our parent group.
        if let Some(grandparent) = parent.parent() {
            enable_controllers(grandparent);
        }
        enable_controllers(parent);
    }

    fs::create_dir(cgroup).map_err(|e| format!("mkdir {}: {}", cgroup.display(), e))?;

    let quota = ((CPU_PERIOD_US as f64) * config.cpus).round().max(1000.0) as u64;
    write_cgroup(cgroup, "cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))?;
    write_cgroup(cgroup, "memory.max", &config.memory_bytes.to_string())?;
    write_cgroup(cgroup, "pids.max", &config.pids_limit.to_string())?;
    if let Err(e) = write_cgroup(cgroup, "memory.swap.max", "0") {
        debug!(error = %e, "swap accounting unavailable");
    }
    Ok(())
}

fn enable_controllers(group: &Path) {
    let control = group.join("cgroup.subtree_control");
    if let Err(e) = fs::write(&control, "+cpu +memory +pids") {
        debug!(path = %control.display(), error = %e, "could not enable controllers");
    }
}

fn write_cgroup(cgroup: &Path, file: &str, value: &str) -> Result<(), String> {
    fs::write(cgroup.join(file), value).map_err(|e| format!("write {} in {}: {}", file, cgroup.display(), e))
}

fn setup_rootfs(sandbox_root: &Path, tmp_size_bytes: u64) -> Result<(), String> {
    // Clean up if exists
    if sandbox_root.exists() {
        cleanup_rootfs(sandbox_root);
    }

    fs::create_dir_all(sandbox_root).map_err(|e| format!("mkdir: {}", e))?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(ROOT_TMPFS_OPTS),
    )
    .map_err(|e| format!("mount tmpfs: {}", e))?;

    // Bind mount system directories read-only
    for dir in &BIND_DIRS {
        let target = sandbox_root.join(&dir[1..]);
        if Path::new(dir).exists() {
            fs::create_dir_all(&target).map_err(|e| format!("mkdir {}: {}", dir, e))?;
            mount(
                Some(*dir),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dir, e))?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("remount ro {}: {}", dir, e))?;
        }
    }

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {}", e))?;
    for dev in &DEVICES {
        let host_dev = format!("/dev/{}", dev);
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "").map_err(|e| format!("touch {}: {}", dev, e))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dev, e))?;
        }
    }

    // Mount point only; proc is mounted from inside the pid namespace.
    fs::create_dir_all(sandbox_root.join("proc")).map_err(|e| format!("mkdir proc: {}", e))?;

    // Scratch space: the only writable place, and nothing there may execute.
    let tmp_dir = sandbox_root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| format!("mkdir tmp: {}", e))?;
    mount(
        Some("tmpfs"),
        &tmp_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some(format!("size={},mode=1777", tmp_size_bytes).as_str()),
    )
    .map_err(|e| format!("mount tmp: {}", e))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
        .map_err(|e| format!("chmod tmp: {}", e))?;

    // Freeze the root itself.
    mount(
        None::<&str>,
        sandbox_root,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| format!("remount root ro: {}", e))?;

    info!(root = %sandbox_root.display(), "Sandbox root prepared");
    Ok(())
}

fn cleanup_rootfs(sandbox_root: &Path) {
    if !sandbox_root.exists() {
        return;
    }
    let _ = umount2(&sandbox_root.join("tmp"), MntFlags::MNT_DETACH);
    let dev_dir = sandbox_root.join("dev");
    for dev in &DEVICES {
        let _ = umount2(&dev_dir.join(dev), MntFlags::MNT_DETACH);
    }
    for dir in BIND_DIRS.iter().rev() {
        let _ = umount2(&sandbox_root.join(&dir[1..]), MntFlags::MNT_DETACH);
    }
    let _ = umount2(sandbox_root, MntFlags::MNT_DETACH);
    // Only the now-empty mount point remains; never recurse into a tree that
    // might still have host directories bound into it.
    if let Err(e) = fs::remove_dir(sandbox_root) {
        warn!(root = %sandbox_root.display(), error = %e, "Failed to remove sandbox root");
    }
}

fn kill_cgroup(cgroup: &Path) {
    if !cgroup.exists() {
        return;
    }
    // cgroup.kill (Linux 5.14+) SIGKILLs the whole subtree atomically.
    if fs::write(cgroup.join("cgroup.kill"), "1").is_ok() {
        return;
    }
    if let Ok(procs) = fs::read_to_string(cgroup.join("cgroup.procs")) {
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

fn remove_cgroup(cgroup: &Path) {
    // rmdir fails with EBUSY until the killed processes are gone.
    for _ in 0..40 {
        match fs::remove_dir(cgroup) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    warn!(cgroup = %cgroup.display(), "cgroup still busy, leaving it behind");
}

// ============================================================================
// `sandterm enter`: runs on the pty, outside the sandbox, single-threaded
// ============================================================================

/// Enter the sandbox described by `args` and run its shell. Returns the
/// shell's exit code (128 + signal when killed).
pub fn enter(args: &EnterArgs) -> Result<i32, String> {
    let procs = args.cgroup.join("cgroup.procs");
    fs::write(&procs, std::process::id().to_string())
        .map_err(|e| format!("join cgroup {}: {}", args.cgroup.display(), e))?;

    let mut clone_flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;
    if !args.share_network {
        clone_flags |= CloneFlags::CLONE_NEWNET;
    }

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let child_args = args.clone();
    let child_fn = Box::new(move || match run_child(&child_args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("sandbox: {}", e);
            let _ = std::io::stderr().flush();
            127
        }
    });

    let child_pid = unsafe { clone(child_fn, &mut stack, clone_flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| format!("clone: {}", e))?;

    loop {
        match waitpid(child_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(format!("waitpid: {}", e)),
        }
    }
}

/// Runs as pid 1 of the new pid namespace.
fn run_child(args: &EnterArgs) -> Result<(), String> {
    // Die with the `enter` process; the whole namespace goes with us.
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| format!("pdeathsig: {}", e))?;

    // Keep our mounts out of the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| format!("make mounts private: {}", e))?;

    mount(
        Some("proc"),
        &args.root.join("proc"),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount proc: {}", e))?;

    sethostname("sandbox").map_err(|e| format!("sethostname: {}", e))?;

    chroot(&args.root).map_err(|e| format!("chroot: {}", e))?;
    chdir("/tmp").map_err(|e| format!("chdir: {}", e))?;

    set_resource_limits()?;
    drop_privileges()?;

    let cmd = CString::new(args.command[0].as_str()).map_err(|e| format!("cmd: {}", e))?;
    let argv = args
        .command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("args: {}", e))?;
    let env = std::env::vars()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("env: {}", e))?;

    execvpe(&cmd, &argv, &env).map_err(|e| format!("exec {}: {}", args.command[0], e))?;
    Ok(())
}

fn set_resource_limits() -> Result<(), String> {
    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| format!("rlimit core: {}", e))?;
    setrlimit(Resource::RLIMIT_NOFILE, 256, 256).map_err(|e| format!("rlimit nofile: {}", e))?;
    Ok(())
}

fn drop_privileges() -> Result<(), String> {
    // Empty the bounding set so no exec can regain a capability.
    for cap in 0..=63 as libc::c_ulong {
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) };
        if rc != 0 {
            // EINVAL marks the end of the kernel's capability list.
            break;
        }
    }

    setgroups(&[]).map_err(|e| format!("setgroups: {}", e))?;
    setgid(Gid::from_raw(NOBODY_GID)).map_err(|e| format!("setgid: {}", e))?;
    setuid(Uid::from_raw(NOBODY_UID)).map_err(|e| format!("setuid: {}", e))?;

    nix::sys::prctl::set_no_new_privs().map_err(|e| format!("no_new_privs: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxCaps, SandboxDefaults, SandboxOverrides};
    use clap::Parser;

    fn config(network: NetworkMode) -> SandboxConfig {
        let caps = SandboxCaps {
            allow_network: true,
            ..SandboxCaps::default()
        };
        SandboxConfig::resolve(
            "bob",
            &SandboxDefaults::default(),
            &caps,
            &SandboxOverrides::default().with_network(network),
        )
        .unwrap()
    }

    #[derive(Parser)]
    struct EnterCli {
        #[command(subcommand)]
        command: Sub,
    }

    #[derive(clap::Subcommand)]
    enum Sub {
        Enter(EnterArgs),
    }

    #[test]
    fn test_shell_command_round_trips_through_enter_args() {
        let rt = IsolateRuntime::new("/run/sandterm", "/sys/fs/cgroup/sandterm", "/usr/bin/sandterm");
        let cmd = rt.shell_command("box1", &config(NetworkMode::None), &["/bin/sh".into(), "-l".into()]);

        assert_eq!(cmd.program, "/usr/bin/sandterm");
        let argv = std::iter::once("sandterm".to_string()).chain(cmd.args.clone());
        let Sub::Enter(parsed) = EnterCli::parse_from(argv).command;

        assert_eq!(parsed.root, PathBuf::from("/run/sandterm/box1"));
        assert_eq!(parsed.cgroup, PathBuf::from("/sys/fs/cgroup/sandterm/box1"));
        assert!(!parsed.share_network);
        assert_eq!(parsed.command, ["/bin/sh", "-l"]);
    }

    #[test]
    fn test_bridge_network_shares_namespace() {
        let rt = IsolateRuntime::new("/r", "/c", "/e");
        let cmd = rt.shell_command("box", &config(NetworkMode::Bridge), &["/bin/sh".into()]);
        assert!(cmd.args.contains(&"--share-network".to_string()));
    }

    #[test]
    fn test_environment_is_minimal() {
        let rt = IsolateRuntime::new("/r", "/c", "/e");
        let cmd = rt.shell_command("box", &config(NetworkMode::None), &["/bin/sh".into()]);
        let keys: Vec<&str> = cmd.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["TERM", "PATH", "HOME", "LANG", "USER_ID"]);
        assert!(cmd.env.contains(&("TERM".to_string(), TERM.to_string())));
    }

    #[tokio::test]
    async fn test_remove_unknown_sandbox_succeeds() {
        let dir = std::env::temp_dir().join(format!("sandterm-test-{}", uuid::Uuid::new_v4()));
        let rt = IsolateRuntime::new(dir.join("roots"), dir.join("cgroups"), "/e");
        rt.remove("never-created").await.unwrap();
    }
}
