//! Foreground launch: `vmctl run` and `vmctl up`.
//!
//! The first Ctrl-C asks guests to power down; the second kills them.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use vmctl::{Graphics, Vm, VmEvent};

use crate::Global;

#[derive(clap::Args)]
pub struct RunArgs {
    /// VM name.
    name: String,

    /// Host window id to embed the SDL display into.
    #[arg(long, value_name = "WINDOW_ID")]
    embed: Option<u64>,

    /// Forward stdin to the serial console (default when headless).
    #[arg(long)]
    console: bool,
}

impl RunArgs {
    pub async fn run(self, global: &Global) -> Result<()> {
        let rt = global.runtime()?;
        let mut vm = rt.get(&self.name)?;
        let mut forward = self.console || vm.config().graphics == Graphics::None;
        let mut events = vm.start(self.embed)?;
        if let Some(state) = vm.runtime() {
            eprintln!("{}: pid {}", vm.name(), state.process().pid());
        }

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut interrupts = 0u32;
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(VmEvent::Stdout(line)) => println!("{line}"),
                    Some(VmEvent::Stderr(line)) => eprintln!("{line}"),
                    Some(VmEvent::Exited { code }) => return finish(vm.name(), code, interrupts > 0),
                    Some(_) => {}
                    None => {
                        let code = vm.wait().await;
                        return finish(vm.name(), code, interrupts > 0);
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    interrupts += 1;
                    interrupt(&mut vm, interrupts).await;
                }
                line = stdin.next_line(), if forward => match line {
                    Ok(Some(mut line)) => {
                        line.push('\n');
                        vm.write_stdin(line.as_bytes()).await?;
                    }
                    _ => forward = false,
                },
            }
        }
    }
}

/// Launches every autostart VM and multiplexes their output until all exit.
pub async fn up(global: &Global) -> Result<()> {
    let rt = global.runtime()?;
    let names = rt.autostart()?;
    if names.is_empty() {
        eprintln!("no VMs are flagged for autostart");
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut vms: Vec<Vm> = Vec::new();
    let mut errors = Vec::new();
    for name in names {
        let launched = rt.get(&name).and_then(|mut vm| {
            let events = vm.start(None)?;
            Ok((vm, events))
        });
        match launched {
            Ok((vm, mut events)) => {
                let idx = vms.len();
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(ev) = events.recv().await {
                        if tx.send((idx, ev)).is_err() {
                            break;
                        }
                    }
                });
                eprintln!("{name}: started");
                vms.push(vm);
            }
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }
    drop(tx);

    let mut running = vms.len();
    let mut interrupts = 0u32;
    while running > 0 {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some((i, VmEvent::Stdout(line))) => println!("{}: {line}", vms[i].name()),
                Some((i, VmEvent::Stderr(line))) => eprintln!("{}: {line}", vms[i].name()),
                Some((i, VmEvent::Exited { code })) => {
                    running -= 1;
                    eprintln!("{}: {}", vms[i].name(), describe(code));
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                for vm in &mut vms {
                    interrupt(vm, interrupts).await;
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join("\n"))
    }
}

/// Stops on the first interrupt, kills on any later one.
async fn interrupt(vm: &mut Vm, count: u32) {
    let result = if count == 1 {
        eprintln!("{}: stopping (Ctrl-C again to kill)", vm.name());
        vm.stop().await
    } else {
        vm.kill()
    };
    if let Err(e) = result {
        eprintln!("{}: {e}", vm.name());
    }
}

fn describe(code: Option<i32>) -> String {
    code.map_or_else(
        || "terminated by signal".to_owned(),
        |c| format!("exited with status {c}"),
    )
}

/// Maps the hypervisor exit to the command result.
fn finish(name: &str, code: Option<i32>, interrupted: bool) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        None if interrupted => Ok(()),
        other => anyhow::bail!("{name}: {}", describe(other)),
    }
}
