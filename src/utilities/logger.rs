use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use colored::{Color, Colorize};
use log::{Level, LevelFilter, Log, Metadata, Record};
use time::macros;

const LOG_FILE: &str = "kolors-client.log";

struct Logger {
    file: Mutex<BufWriter<File>>,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match metadata.target().split("::").next().unwrap() {
            "kolors_client" => true,
            _ => metadata.level() <= Level::Info,
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = time::OffsetDateTime::now_utc()
            .format(macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
            .unwrap();
        let level = record.level();
        let args = record.args();

        let color = match level {
            Level::Error => Color::BrightRed,
            Level::Warn => Color::BrightYellow,
            Level::Info => Color::BrightCyan,
            Level::Debug => Color::Magenta,
            Level::Trace => Color::Green,
        };

        println!("{} {} {args}", timestamp.color(Color::BrightBlack), level.as_str().color(color));
        writeln!(self.file.lock().unwrap(), "{timestamp} [{} {level}] {args}", record.target())
            .unwrap();
    }

    fn flush(&self) {
        self.file.lock().unwrap().flush().unwrap();
    }
}

pub fn init() {
    let file = Mutex::new(BufWriter::new(File::create(LOG_FILE).unwrap()));
    log::set_max_level(LevelFilter::Debug);
    log::set_boxed_logger(Box::new(Logger { file })).unwrap();
}
