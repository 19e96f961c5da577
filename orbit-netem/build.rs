use std::{
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Context as _, Result, anyhow};
use aya_build::Toolchain;
use cargo_metadata::{Artifact, CompilerMessage, Message, Target};

const EBPF_PACKAGE: &str = "orbit-netem-ebpf";
/// Binary name of the eBPF crate, and the file the loader embeds.
const EBPF_OBJECT: &str = "orbit-netem";

fn main() -> Result<()> {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_EBPF");
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);

    if env::var_os("CARGO_FEATURE_EBPF").is_none() {
        // An empty object makes the loader report the program as unavailable.
        return fs::write(out_dir.join(EBPF_OBJECT), b"")
            .with_context(|| format!("failed to write placeholder {EBPF_OBJECT} object"));
    }

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let manifest_path = packages
        .into_iter()
        .find(|package| package.name.as_str() == EBPF_PACKAGE)
        .map(|package| package.manifest_path)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;

    build_ebpf(root_dir.as_std_path(), &out_dir, Toolchain::default())
}

fn bpf_target() -> Result<(String, String)> {
    let endian =
        env::var_os("CARGO_CFG_TARGET_ENDIAN").ok_or(anyhow!("CARGO_CFG_TARGET_ENDIAN not set"))?;
    let target = match endian.to_string_lossy().as_ref() {
        "big" => "bpfeb",
        "little" => "bpfel",
        other => return Err(anyhow!("unsupported endian={other}")),
    };
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let arch = if arch.starts_with("riscv64") {
        "riscv64".to_string()
    } else {
        arch
    };
    Ok((format!("{target}-unknown-none"), arch))
}

/// Builds the eBPF crate with a nightly toolchain and copies its binaries
/// into `out_dir`. Compiler output is forwarded with an `[ebpf]` prefix.
fn build_ebpf(root_dir: &Path, out_dir: &Path, toolchain: Toolchain<'_>) -> Result<()> {
    println!("cargo:rerun-if-changed={}", root_dir.display());
    let (target, arch) = bpf_target()?;
    let toolchain = match toolchain {
        Toolchain::Nightly => "nightly",
        Toolchain::Custom(name) => name,
    };

    let mut cmd = Command::new("rustup");
    cmd.args([
        "run",
        toolchain,
        "cargo",
        "build",
        "--package",
        EBPF_PACKAGE,
        "-Z",
        "build-std=core",
        "--bins",
        "--message-format=json",
        "--release",
        "--target",
        &target,
    ]);

    const SEPARATOR: &str = "\x1f";
    let mut rustflags = OsString::new();
    for part in [
        "--cfg=bpf_target_arch=\"",
        &arch,
        "\"",
        SEPARATOR,
        "-Cdebuginfo=2",
        SEPARATOR,
        "-Clink-arg=--btf",
    ] {
        rustflags.push(part);
    }
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);
    for key in ["RUSTC", "RUSTC_WORKSPACE_WRAPPER"] {
        cmd.env_remove(key);
    }
    cmd.arg("--target-dir").arg(out_dir.join(EBPF_PACKAGE));

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;
    let Child { stdout, stderr, .. } = &mut child;
    let stderr = stderr.take().ok_or(anyhow!("stderr not piped"))?;
    let stdout = stdout.take().ok_or(anyhow!("stdout not piped"))?;

    let stderr_handle = thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => eprintln!("[ebpf] {line}"),
                Err(err) => eprintln!("[ebpf] failed to read stderr: {err}"),
            }
        }
    });

    let mut executables = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("malformed cargo message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target: Target { name, .. },
                ..
            }) => executables.push((name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                for line in message.rendered.iter().flat_map(|r| r.lines()) {
                    eprintln!("[ebpf] {line}");
                }
            }
            Message::TextLine(line) => eprintln!("[ebpf] {line}"),
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    if !status.success() {
        return Err(anyhow!("{cmd:?} failed: {status:?}"));
    }
    stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr forwarding thread panicked"))?;

    for (name, binary) in executables {
        let dst = out_dir.join(name);
        fs::copy(&binary, &dst).with_context(|| format!("failed to copy {binary:?} to {dst:?}"))?;
    }
    Ok(())
}
