use assert_cmd::Command;
use assert_fs::TempDir;
use rstest::fixture;
use std::path::Path;

#[fixture]
pub fn repository_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

#[fixture]
pub fn init_repository_dir(repository_dir: TempDir) -> TempDir {
    run_fidx_command(repository_dir.path(), &["init"])
        .assert()
        .success();

    repository_dir
}

pub fn run_fidx_command(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("fidx").expect("Failed to find fidx binary");
    cmd.env_remove("FIDX_LOG");
    cmd.current_dir(dir);
    for arg in args {
        cmd.arg(arg);
    }
    cmd
}

pub fn write_config(dir: &Path, content: &str) {
    std::fs::write(dir.join(".fidx").join("config.toml"), content)
        .expect("Failed to write config file");
}
