use anyhow::{bail, Context};
use ssms_timetable_lib::config::ServiceConfig;
use ssms_timetable_lib::models::RawRow;
use ssms_timetable_lib::service::TimetableService;
use std::path::PathBuf;

const USAGE: &str = "usage: ssms-timetable [--config <file>] <seed | export <file> | import <file> | clear>";

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    let config_path = match args.iter().position(|arg| arg == "--config") {
        Some(index) => {
            if index + 1 >= args.len() {
                bail!("--config needs a file\n{}", USAGE);
            }
            let path = PathBuf::from(args.remove(index + 1));
            args.remove(index);
            Some(path)
        }
        None => None,
    };

    let config = ServiceConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    let service = ssms_timetable_lib::bootstrap(config).context("failed to open timetable service")?;
    let admin = TimetableService::system_principal();

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["seed"] => {
            let report = service.load_demo_schedules(&admin)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["export", file] => {
            let rows = service.export_rows(&admin)?;
            std::fs::write(file, serde_json::to_string_pretty(&rows)?)
                .with_context(|| format!("failed to write {}", file))?;
            println!("exported {} rows to {}", rows.len(), file);
        }
        ["import", file] => {
            let raw = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?;
            let rows: Vec<RawRow> = serde_json::from_str(&raw).with_context(|| format!("invalid rows in {}", file))?;
            let report = service.import_rows(&admin, &rows)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["clear"] => {
            let report = service.clear_all(&admin)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => bail!("{}", USAGE),
    }

    Ok(())
}
