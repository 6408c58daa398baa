// SPDX-License-Identifier: GPL-3.0-only

use std::io::Write;
use std::process::{Command, Stdio};

use crate::{Result, SysError};

pub(crate) fn require_tool(name: &str) -> Result<()> {
    which::which(name)
        .map(|_| ())
        .map_err(|_| SysError::MissingTool(name.to_string()))
}

pub(crate) fn run_capture(command: &str, args: &[&str]) -> Result<String> {
    tracing::debug!("running {command} {}", args.join(" "));
    let output = Command::new(command).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SysError::ToolFailed {
            tool: command.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn run_checked(command: &str, args: &[&str]) -> Result<()> {
    run_capture(command, args).map(|_| ())
}

/// Run a tool with a script on stdin (the sfdisk idiom).
pub(crate) fn run_with_input(command: &str, args: &[&str], input: &str) -> Result<String> {
    tracing::debug!("running {command} {} with script input", args.join(" "));
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(input.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SysError::ToolFailed {
            tool: command.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Probe the content type blkid reports for a device, if any.
pub(crate) fn probe_type(path: &str) -> Option<String> {
    if which::which("blkid").is_err() {
        return None;
    }
    let probed = run_capture("blkid", &["-o", "value", "-s", "TYPE", path]).ok()?;
    let probed = probed.trim();
    (!probed.is_empty()).then(|| probed.to_string())
}

/// Size of a block device in bytes.
pub(crate) fn block_device_size(path: &str) -> Result<u64> {
    let output = run_capture("blockdev", &["--getsize64", path])?;
    output
        .trim()
        .parse()
        .map_err(|_| SysError::Parse(format!("blockdev output for {path}: {output}")))
}

/// Mount point of a device, from /proc/mounts.
pub(crate) fn mount_point_of(path: &str) -> Option<String> {
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    find_mount_point(&mounts, path)
}

pub(crate) fn find_mount_point(mounts: &str, path: &str) -> Option<String> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let mount_point = fields.next()?;
        (device == path).then(|| mount_point.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_mount_point_in_proc_mounts() {
        let mounts = "/dev/sda1 / ext4 rw,relatime 0 0\n/dev/sdb1 /data xfs rw 0 0\n";
        assert_eq!(find_mount_point(mounts, "/dev/sdb1").as_deref(), Some("/data"));
        assert_eq!(find_mount_point(mounts, "/dev/sdc1"), None);
    }
}
