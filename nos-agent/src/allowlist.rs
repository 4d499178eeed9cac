//! Command allowlist for the privileged exec surface.
//!
//! Every `(command, args)` tuple must match one of the structural shapes
//! below before a child process is spawned. Matching is positional and
//! literal; nothing is escaped or rewritten. Unrecognized tools, flags, or
//! argument shapes are rejected wholesale.

use nos_common::{Error, Result};

/// Rejection code surfaced for every allowlist failure.
pub const INVALID_COMMAND: &str = "invalid_command";

/// A device path: `/dev/...`, no whitespace, no parent traversal.
pub fn is_device_path(arg: &str) -> bool {
    arg.starts_with("/dev/")
        && arg.len() > "/dev/".len()
        && !arg.chars().any(char::is_whitespace)
        && !arg.split('/').any(|c| c == "..")
}

/// A mount path: absolute, under `/srv/` or `/mnt/`, no whitespace, no
/// parent traversal.
pub fn is_mount_path(arg: &str) -> bool {
    (arg.starts_with("/srv/") || arg.starts_with("/mnt/"))
        && !arg.chars().any(char::is_whitespace)
        && !arg.split('/').any(|c| c == "..")
}

fn is_abs_path(arg: &str) -> bool {
    arg.starts_with('/')
        && !arg.chars().any(char::is_whitespace)
        && !arg.split('/').any(|c| c == "..")
}

fn reject() -> Error {
    Error::NotAllowed(INVALID_COMMAND.to_string())
}

/// Check a single step against the allowlist.
pub fn validate(cmd: &str, args: &[String]) -> Result<()> {
    let ok = match cmd {
        "wipefs" => validate_wipefs(args),
        "mkfs.btrfs" => validate_mkfs(args),
        "mount" => validate_mount(args),
        "umount" => validate_umount(args),
        "blkid" => validate_blkid(args),
        "btrfs" => validate_btrfs(args),
        "cryptsetup" => validate_cryptsetup(args),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(reject())
    }
}

/// Boolean form of [`validate`].
pub fn allowed(cmd: &str, args: &[String]) -> bool {
    validate(cmd, args).is_ok()
}

/// True when the step is a read-only status probe (shorter timeout class).
pub fn is_probe(cmd: &str, args: &[String]) -> bool {
    match cmd {
        "blkid" => true,
        "wipefs" => args.first().map(String::as_str) == Some("-n"),
        "btrfs" => matches!(
            (args.first().map(String::as_str), args.get(1).map(String::as_str)),
            (Some("replace"), Some("status"))
                | (Some("balance"), Some("status"))
                | (Some("filesystem"), Some("show"))
                | (Some("filesystem"), Some("usage"))
        ),
        _ => false,
    }
}

// wipefs [-n|-a] <dev>
fn validate_wipefs(args: &[String]) -> bool {
    match args {
        [dev] => is_device_path(dev),
        [flag, dev] => (flag == "-n" || flag == "-a") && is_device_path(dev),
        _ => false,
    }
}

// mkfs.btrfs -L <label> -d <profile> -m <profile> <dev>... (order-free flags)
fn validate_mkfs(args: &[String]) -> bool {
    let mut label = false;
    let mut data_profile = false;
    let mut meta_profile = false;
    let mut devices = 0usize;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-L" => {
                let Some(value) = args.get(i + 1) else {
                    return false;
                };
                if label || value.starts_with('-') || value.is_empty() {
                    return false;
                }
                label = true;
                i += 2;
            }
            "-d" | "-m" => {
                let Some(value) = args.get(i + 1) else {
                    return false;
                };
                if !matches!(value.as_str(), "single" | "dup" | "raid1" | "raid10") {
                    return false;
                }
                if args[i] == "-d" {
                    if data_profile {
                        return false;
                    }
                    data_profile = true;
                } else {
                    if meta_profile {
                        return false;
                    }
                    meta_profile = true;
                }
                i += 2;
            }
            dev if is_device_path(dev) => {
                devices += 1;
                i += 1;
            }
            _ => return false,
        }
    }

    label && data_profile && meta_profile && devices >= 1
}

// mount -t btrfs [-o <opts>] <UUID=...|dev> <absDst>
fn validate_mount(args: &[String]) -> bool {
    let mut rest = args;
    let [t_flag, fstype, tail @ ..] = rest else {
        return false;
    };
    if t_flag != "-t" || fstype != "btrfs" {
        return false;
    }
    rest = tail;

    if rest.first().map(String::as_str) == Some("-o") {
        let Some(opts) = rest.get(1) else {
            return false;
        };
        if opts.is_empty() || opts.chars().any(char::is_whitespace) {
            return false;
        }
        rest = &rest[2..];
    }

    let [source, dst] = rest else {
        return false;
    };
    let source_ok = is_device_path(source)
        || (source.starts_with("UUID=")
            && source.len() > "UUID=".len()
            && source["UUID=".len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-'));
    source_ok && is_mount_path(dst)
}

// umount <absPath>
fn validate_umount(args: &[String]) -> bool {
    matches!(args, [path] if is_mount_path(path))
}

// blkid -s UUID -o value <dev>
fn validate_blkid(args: &[String]) -> bool {
    matches!(
        args,
        [s, uuid, o, value, dev]
            if s == "-s" && uuid == "UUID" && o == "-o" && value == "value" && is_device_path(dev)
    )
}

// btrfs <subcommand...> with device/mount operands only
fn validate_btrfs(args: &[String]) -> bool {
    let (group, verb, operands) = match args {
        [group, verb, rest @ ..] => (group.as_str(), verb.as_str(), rest),
        _ => return false,
    };

    let verb_ok = matches!(
        (group, verb),
        ("device", "add")
            | ("device", "remove")
            | ("replace", "start")
            | ("replace", "status")
            | ("balance", "start")
            | ("balance", "status")
            | ("balance", "cancel")
            | ("filesystem", "show")
            | ("filesystem", "usage")
    );
    if !verb_ok {
        return false;
    }

    // Operands must be devices, numeric device ids (replace), or mount
    // paths; every path that is not a device must pass the mount check.
    if operands.is_empty() {
        return false;
    }
    operands.iter().all(|op| {
        is_device_path(op) || is_mount_path(op) || op.chars().all(|c| c.is_ascii_digit())
    })
}

// cryptsetup luksFormat/open/close with fixed flag sets
fn validate_cryptsetup(args: &[String]) -> bool {
    match args.first().map(String::as_str) {
        Some("luksFormat") => {
            let mut rest = &args[1..];
            if rest.first().map(String::as_str) == Some("--type") {
                if rest.get(1).map(String::as_str) != Some("luks2") {
                    return false;
                }
                rest = &rest[2..];
            }
            if rest.first().map(String::as_str) == Some("--batch-mode") {
                rest = &rest[1..];
            }
            matches!(rest, [dev] if is_device_path(dev))
        }
        Some("open") => {
            matches!(
                &args[1..],
                [key_flag, key, dev, name]
                    if key_flag == "--key-file"
                        && is_abs_path(key)
                        && is_device_path(dev)
                        && name.starts_with("luks-")
                        && !name.chars().any(char::is_whitespace)
            )
        }
        Some("close") => {
            matches!(
                &args[1..],
                [name] if name.starts_with("luks-") && !name.chars().any(char::is_whitespace)
            )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_btrfs_balance_status_paths() {
        assert!(allowed("btrfs", &argv(&["balance", "status", "/srv/pool/x"])));
        assert!(!allowed("btrfs", &argv(&["balance", "status", "../../etc"])));
        assert!(!allowed("btrfs", &argv(&[";", "rm", "-rf", "/"])));
    }

    #[test]
    fn test_unknown_tool_rejected() {
        assert!(!allowed("rm", &argv(&["-rf", "/"])));
        assert!(!allowed("sh", &argv(&["-c", "id"])));
        assert!(!allowed("nft", &argv(&["list", "ruleset"])));
    }

    #[test]
    fn test_wipefs_shapes() {
        assert!(allowed("wipefs", &argv(&["/dev/sdb"])));
        assert!(allowed("wipefs", &argv(&["-n", "/dev/sdb"])));
        assert!(allowed("wipefs", &argv(&["-a", "/dev/sdb"])));
        assert!(!allowed("wipefs", &argv(&["-x", "/dev/sdb"])));
        assert!(!allowed("wipefs", &argv(&["-a", "/tmp/fake"])));
        assert!(!allowed("wipefs", &argv(&["/dev/sd b"])));
        assert!(!allowed("wipefs", &argv(&["/dev/../etc/passwd"])));
    }

    #[test]
    fn test_mkfs_requires_label_and_profiles() {
        assert!(allowed(
            "mkfs.btrfs",
            &argv(&["-L", "pool", "-d", "raid1", "-m", "raid1", "/dev/sda", "/dev/sdb"])
        ));
        assert!(!allowed(
            "mkfs.btrfs",
            &argv(&["-d", "raid1", "-m", "raid1", "/dev/sda"])
        ));
        assert!(!allowed(
            "mkfs.btrfs",
            &argv(&["-L", "pool", "-d", "raid1", "-m", "raid1"])
        ));
        assert!(!allowed(
            "mkfs.btrfs",
            &argv(&["-L", "pool", "-d", "raid9", "-m", "raid1", "/dev/sda"])
        ));
        assert!(!allowed(
            "mkfs.btrfs",
            &argv(&["-L", "pool", "-f", "-d", "single", "-m", "single", "/dev/sda"])
        ));
    }

    #[test]
    fn test_mount_shapes() {
        assert!(allowed(
            "mount",
            &argv(&["-t", "btrfs", "/dev/sda1", "/srv/pool"])
        ));
        assert!(allowed(
            "mount",
            &argv(&["-t", "btrfs", "-o", "noatime,compress=zstd", "UUID=abcd-1234", "/mnt/data"])
        ));
        assert!(!allowed(
            "mount",
            &argv(&["-t", "ext4", "/dev/sda1", "/srv/pool"])
        ));
        assert!(!allowed(
            "mount",
            &argv(&["-t", "btrfs", "/dev/sda1", "/home/user"])
        ));
        assert!(!allowed(
            "mount",
            &argv(&["-t", "btrfs", "/dev/sda1", "/srv/../etc"])
        ));
    }

    #[test]
    fn test_umount_shape() {
        assert!(allowed("umount", &argv(&["/srv/pool"])));
        assert!(!allowed("umount", &argv(&["/etc"])));
        assert!(!allowed("umount", &argv(&["/srv/pool", "-l"])));
    }

    #[test]
    fn test_blkid_shape() {
        assert!(allowed(
            "blkid",
            &argv(&["-s", "UUID", "-o", "value", "/dev/sda1"])
        ));
        assert!(!allowed("blkid", &argv(&["/dev/sda1"])));
        assert!(!allowed(
            "blkid",
            &argv(&["-s", "LABEL", "-o", "value", "/dev/sda1"])
        ));
    }

    #[test]
    fn test_btrfs_verbs() {
        assert!(allowed(
            "btrfs",
            &argv(&["device", "add", "/dev/sdc", "/srv/pool"])
        ));
        assert!(allowed(
            "btrfs",
            &argv(&["replace", "start", "1", "/dev/sdd", "/srv/pool"])
        ));
        assert!(allowed("btrfs", &argv(&["filesystem", "usage", "/mnt/data"])));
        assert!(!allowed("btrfs", &argv(&["subvolume", "delete", "/srv/pool"])));
        assert!(!allowed("btrfs", &argv(&["balance", "start"])));
        assert!(!allowed(
            "btrfs",
            &argv(&["balance", "start", "-dconvert=raid1", "/srv/pool"])
        ));
    }

    #[test]
    fn test_cryptsetup_shapes() {
        assert!(allowed("cryptsetup", &argv(&["luksFormat", "/dev/sdb1"])));
        assert!(allowed(
            "cryptsetup",
            &argv(&["luksFormat", "--type", "luks2", "--batch-mode", "/dev/sdb1"])
        ));
        assert!(allowed(
            "cryptsetup",
            &argv(&["open", "--key-file", "/etc/nos/keys/pool.key", "/dev/sdb1", "luks-pool"])
        ));
        assert!(allowed("cryptsetup", &argv(&["close", "luks-pool"])));
        assert!(!allowed(
            "cryptsetup",
            &argv(&["open", "--key-file", "relative.key", "/dev/sdb1", "luks-pool"])
        ));
        assert!(!allowed(
            "cryptsetup",
            &argv(&["open", "--key-file", "/etc/k", "/dev/sdb1", "pool"])
        ));
        assert!(!allowed("cryptsetup", &argv(&["luksDump", "/dev/sdb1"])));
    }

    #[test]
    fn test_probe_classification() {
        assert!(is_probe("blkid", &argv(&["-s", "UUID", "-o", "value", "/dev/sda"])));
        assert!(is_probe("btrfs", &argv(&["balance", "status", "/srv/pool"])));
        assert!(is_probe("wipefs", &argv(&["-n", "/dev/sda"])));
        assert!(!is_probe("wipefs", &argv(&["-a", "/dev/sda"])));
        assert!(!is_probe("mkfs.btrfs", &argv(&[])));
    }
}
