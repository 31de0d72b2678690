use crate::prelude::*;

use std::cell::RefCell;

use clap::{Args, ValueEnum};
use console::style;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

// Diagnostics are built from two pieces: an ordinary fmt subscriber for log
// events, and a cheap thread-local "context trail" that error reports get
// stamped with. The trail is a stack of human-readable frames ("Fetching
// <url>", "Unpacking <wheel>") pushed by the context! macro and popped by an
// RAII guard, so whatever eyre report is in flight can say where the failure
// happened without every call site threading wrap_err chains by hand.
//
// The trail is per-thread. Executor workers each accumulate their own, which
// is exactly what you want: a failed operation reports the frames of the
// operation that failed, not whatever another worker was doing.

thread_local! {
    static CONTEXT_TRAIL: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

/// Guard returned by [`push_context`]; pops its frame when dropped.
pub struct ContextFrame {
    _not_send: std::marker::PhantomData<*const ()>,
}

pub fn push_context(frame: String) -> ContextFrame {
    CONTEXT_TRAIL.with(|trail| trail.borrow_mut().push(frame));
    ContextFrame {
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for ContextFrame {
    fn drop(&mut self) {
        CONTEXT_TRAIL.with(|trail| {
            trail.borrow_mut().pop();
        });
    }
}

fn current_trail() -> Vec<String> {
    CONTEXT_TRAIL.with(|trail| trail.borrow().clone())
}

#[macro_export]
macro_rules! context {
    ($($arg:tt)*) => {
        let _context_frame = $crate::output::push_context(format!($($arg)*));
    };
}

/// Eyre hook: capture the context trail (and, on request, a backtrace) at
/// the moment the error is constructed, and render both after the error
/// itself.
struct TrailHandler {
    trail: Vec<String>,
    backtrace: Option<backtrace::Backtrace>,
}

impl TrailHandler {
    fn capture() -> TrailHandler {
        let backtrace = if std::env::var_os("SPRIG_BACKTRACE").is_some() {
            Some(backtrace::Backtrace::new_unresolved())
        } else {
            None
        };
        TrailHandler {
            trail: current_trail(),
            backtrace,
        }
    }
}

impl eyre::EyreHandler for TrailHandler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        write!(f, "{}", error)?;
        let mut source = error.source();
        while let Some(cause) = source {
            write!(f, "\n  caused by: {}", cause)?;
            source = cause.source();
        }
        // innermost frame first: it names the operation that actually failed
        for frame in self.trail.iter().rev() {
            write!(f, "\n  while: {}", frame)?;
        }
        if let Some(backtrace) = &self.backtrace {
            let mut resolved = backtrace.clone();
            resolved.resolve();
            write!(f, "\n\nBacktrace:\n{resolved:?}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
    #[arg(long, default_value_t = ColorChoice::Auto, value_enum, value_name = "WHEN", global = true)]
    color: ColorChoice,
}

pub fn init(args: &OutputArgs) {
    eyre::set_hook(Box::new(|_| Box::new(TrailHandler::capture())))
        .expect("eyre handler already installed?");

    match args.color {
        ColorChoice::Auto => (),
        ColorChoice::Always => console::set_colors_enabled_stderr(true),
        ColorChoice::Never => console::set_colors_enabled_stderr(false),
    }

    let verbosity = i16::from(args.verbose) - i16::from(args.quiet);
    // tracing orders TRACE as the noisiest level, so -v opens up debug
    // logging and -vv the full firehose
    let level = match verbosity {
        i16::MIN..=-2 => LevelFilter::ERROR,
        -1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // SPRIG_LOG takes an env-filter directive string and overrides the
    // flag-derived level wholesale
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("SPRIG_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Final error rendering for the CLI shell.
pub fn report_failure(err: &eyre::Report) {
    eprintln!("{} {:?}", style("error:").red().bold().for_stderr(), err);
}
