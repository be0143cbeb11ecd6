//! Linux `/proc` readers used by the readiness probe
//!
//! All functions degrade to "unknown" (empty/`None`) on other platforms or
//! when the relevant files are unreadable, so callers can fall back to a
//! plain TCP connect.

use std::collections::HashSet;
use std::path::PathBuf;

const TCP_LISTEN: u8 = 0x0A;

pub type Inode = u64;

fn root_path() -> PathBuf {
    PathBuf::from("/proc")
}

/// Whether the kernel listener table can be read at all
pub fn listener_table_available() -> bool {
    cfg!(target_os = "linux") && root_path().join("net/tcp").exists()
}

/// Inodes of sockets in LISTEN state on `port`, across `tcp` and `tcp6`.
///
/// Returns `None` if neither table could be read.
pub fn listening_inodes(port: u16) -> Option<Vec<Inode>> {
    let mut found = None;
    for table in ["tcp", "tcp6"] {
        let Ok(contents) = std::fs::read_to_string(root_path().join("net").join(table)) else {
            continue;
        };
        found
            .get_or_insert_with(Vec::new)
            .extend(parse_listen_table(&contents, port));
    }
    found
}

/// Parse a `/proc/net/tcp{,6}` table and return the inodes listening on `port`
pub fn parse_listen_table(contents: &str, port: u16) -> Vec<Inode> {
    contents
        .lines()
        .skip(1) // header
        .filter_map(parse_socket_line)
        .filter(|&(state, local_port, _)| state == TCP_LISTEN && local_port == port)
        .map(|(_, _, inode)| inode)
        .collect()
}

fn parse_socket_line(line: &str) -> Option<(u8, u16, Inode)> {
    let mut fields = line.split_whitespace();
    let local_address = fields.nth(1)?; // field 1: local address
    let state = fields.nth(1)?; // field 3: state (skip remote address)
    let inode = fields.nth(5)?; // field 9: inode (skip fields 4-8)

    let (_, port_hex) = local_address.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let state = u8::from_str_radix(state, 16).ok()?;
    let inode = inode.parse().ok()?;
    Some((state, port, inode))
}

/// Parse an fd link target of the form `socket:[12345]`
pub fn socket_inode(link: &str) -> Option<Inode> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Find the pid holding any of `inodes` open, scanning `/proc/*/fd`.
///
/// Processes whose fd directory is not readable are skipped, so `None`
/// means "unknown", not "nobody".
pub fn socket_owner(inodes: &[Inode]) -> Option<u32> {
    if inodes.is_empty() {
        return None;
    }
    let wanted: HashSet<Inode> = inodes.iter().copied().collect();
    let entries = std::fs::read_dir(root_path()).ok()?;

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid_owns_any(pid, &wanted) {
            return Some(pid);
        }
    }
    None
}

fn pid_owns_any(pid: u32, wanted: &HashSet<Inode>) -> bool {
    let Ok(fds) = std::fs::read_dir(root_path().join(pid.to_string()).join("fd")) else {
        return false;
    };
    fds.flatten().any(|fd| {
        std::fs::read_link(fd.path())
            .ok()
            .and_then(|target| target.to_str().and_then(socket_inode))
            .is_some_and(|inode| wanted.contains(&inode))
    })
}

/// All descendants of `pid`, breadth first.
///
/// A child may exit between being listed here and being used by the
/// caller; callers must re-check anything they learn from this.
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut seen = HashSet::from([pid]);
    let mut queue = vec![pid];
    let mut result = Vec::new();

    while let Some(parent) = queue.pop() {
        for child in children(parent) {
            if seen.insert(child) {
                result.push(child);
                queue.push(child);
            }
        }
    }
    result
}

fn children(pid: u32) -> Vec<u32> {
    let task_dir = root_path().join(pid.to_string()).join("task");
    let Ok(tasks) = std::fs::read_dir(task_dir) else {
        return Vec::new();
    };
    tasks
        .flatten()
        .filter_map(|task| std::fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|contents| parse_pid_list(&contents))
        .collect()
}

/// Parse a whitespace-separated pid list, as found in `task/*/children`
pub fn parse_pid_list(contents: &str) -> Vec<u32> {
    contents
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect()
}

/// Whether a debugger (any ptrace tracer) is attached to `pid`
pub fn is_traced(pid: u32) -> bool {
    std::fs::read_to_string(root_path().join(pid.to_string()).join("status"))
        .ok()
        .and_then(|status| parse_tracer_pid(&status))
        .is_some_and(|tracer| tracer != 0)
}

/// Extract `TracerPid` from the contents of `/proc/<pid>/status`
pub fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
