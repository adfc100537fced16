use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Routes the `log` facade onto the kernel console, tagged with the id of
/// the processor that produced the record.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

pub(crate) fn init() {
	log::set_logger(&LOGGER).expect("the logger must only be initialized once");
	if cfg!(debug_assertions) {
		log::set_max_level(LevelFilter::Debug);
	} else {
		log::set_max_level(LevelFilter::Info);
	}
}

struct ColorLevel(Level);

impl core::fmt::Display for ColorLevel {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let level = self.0;

		let color = match level {
			Level::Trace => AnsiColor::Magenta,
			Level::Debug => AnsiColor::Blue,
			Level::Info => AnsiColor::Green,
			Level::Warn => AnsiColor::Yellow,
			Level::Error => AnsiColor::Red,
		};

		let style = anstyle::Style::new().fg_color(Some(color.into()));
		write!(f, "{style}{level}{style:#}")
	}
}

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			crate::console::print(format_args!(
				"[{}][{}] {}\n",
				crate::ke::core_id(),
				ColorLevel(record.level()),
				record.args()
			));
		}
	}

	fn flush(&self) {}
}
