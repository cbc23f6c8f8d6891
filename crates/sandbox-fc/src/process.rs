use crate::command::{CommandError, Privilege, exec_ignore_errors};

/// Kill an entire process tree rooted at `pid`.
///
/// The spawn chain is `sudo -> ip netns exec -> sudo -> firecracker`, so a
/// plain SIGKILL on the leader leaves orphans. Walk children via `pgrep -P`
/// depth-first, then kill leaves upward.
pub(crate) async fn kill_process_tree(pid: u32) {
    let mut stack = vec![pid];
    let mut order = Vec::new();

    while let Some(current) = stack.pop() {
        order.push(current);
        if let Ok(out) = crate::command::exec("pgrep", &["-P", &current.to_string()], Privilege::User).await
        {
            for child in out.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
                stack.push(child);
            }
        }
    }

    // Children first so re-parenting doesn't hide them from us.
    for pid in order.iter().rev() {
        exec_ignore_errors("kill", &["-9", &pid.to_string()], Privilege::Sudo).await;
    }
}

/// Resolve the current username via `getuid()`.
pub(crate) fn current_username() -> Result<String, CommandError> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| CommandError {
            command: "getuid".into(),
            detail: format!("lookup uid {uid}: {e}"),
        })?
        .ok_or_else(|| CommandError {
            command: "getuid".into(),
            detail: format!("no user for uid {uid}"),
        })?;
    Ok(user.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_username_resolves() {
        let name = current_username().unwrap();
        assert!(!name.is_empty());
    }
}
