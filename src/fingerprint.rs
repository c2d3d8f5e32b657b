//! 本机指纹
//!
//! Agent Hub 用机器指纹区分本地与远端 agent："本地" 是派生谓词
//! （agent.machine_id == 本机指纹），不是存储字段。

use std::path::Path;

/// 返回本机的稳定指纹
///
/// Linux 优先读 machine-id；其余平台（或读取失败时）退化为主机名。
/// 指纹只需在 hub 可见的机器集合内稳定且互不相同。
pub fn machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Some(id) = read_id_file(path) {
            return id;
        }
    }
    hostname()
}

/// 本机主机名（取不到时回退 "unknown"）
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

fn read_id_file(path: impl AsRef<Path>) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let id = content.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
