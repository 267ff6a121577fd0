//! `cdbox top` command: processes of a running container.

use cdbox_core::error::{BoxError, Result};
use clap::Args;
use comfy_table::Table;
use sysinfo::{Pid, System};

use crate::app::App;
use crate::output::new_table;

#[derive(Args, Debug)]
pub struct TopArgs {
    /// Container name or ID
    pub container: String,
}

/// `01:02:03`
fn clock(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// A `ps -ef` style table of `pids`; processes that vanished are skipped.
pub(crate) fn process_table(pids: &[u32]) -> Table {
    let mut sys = System::new();
    let mut table = new_table(&["UID", "PID", "PPID", "C", "STIME", "TIME", "CMD"]);
    for &pid in pids {
        let spid = Pid::from_u32(pid);
        if !sys.refresh_process(spid) {
            continue;
        }
        let Some(p) = sys.process(spid) else {
            continue;
        };
        let uid = p.user_id().map(|u| (**u).to_string()).unwrap_or_default();
        let ppid = p.parent().map(|pp| pp.as_u32().to_string()).unwrap_or_else(|| "0".into());
        let stime = chrono::DateTime::from_timestamp(p.start_time() as i64, 0)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
            .unwrap_or_default();
        let cmd = if p.cmd().is_empty() {
            format!("[{}]", p.name())
        } else {
            p.cmd().join(" ")
        };
        table.add_row(vec![
            uid,
            pid.to_string(),
            ppid,
            format!("{:.0}", p.cpu_usage()),
            stime,
            clock(p.run_time()),
            cmd,
        ]);
    }
    table
}

pub async fn execute(app: &App, args: TopArgs) -> Result<()> {
    let mgr = app.manager()?;
    let container = mgr.find(&args.container).await?;
    if !container.status().is_live() {
        return Err(BoxError::Precondition(format!(
            "container {} is not running",
            container.name()
        )));
    }
    let pids = mgr.services().tasks.pids(container.id()).await?;
    println!("{}", process_table(&pids));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock() {
        assert_eq!(clock(0), "00:00:00");
        assert_eq!(clock(3723), "01:02:03");
    }

    #[test]
    fn test_table_has_own_process() {
        let table = process_table(&[std::process::id(), u32::MAX - 1]);
        assert_eq!(table.row_iter().count(), 1);
    }
}
