#[macro_use]
extern crate log;

pub mod runtime;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use common::errors::*;
use flow::program::Program;
use flow::runtime::Runtime;
use http::channel::{Channel, ChannelConfig, HttpHandler};
use http::date::DateSource;
use http::v1::connection::Http1Connection;
use http::v1::parser::ParserLimits;
use net::listener::{ListenerOptions, SchedulerSelector, TcpListener};
use net::scheduler::{Scheduler, SchedulerPool};

use crate::runtime::{core_runtime, ServerSettings};

/// Command-line overrides applied on top of the configuration.
#[derive(Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub workers: Option<usize>,
}

/// Bridges one HTTP request into the compiled Flow program: the channel
/// is the native context, `main` is the entry handler.
struct FlowHandler {
    program: Arc<Program>,
    runtime: Arc<Runtime>,
}

impl HttpHandler for FlowHandler {
    fn handle(&self, channel: &mut Channel) -> Result<()> {
        let context: &mut dyn Any = channel;
        let handled =
            flow::vm::run_named(&self.program, &self.runtime, "main", context)
                .map_err(|trap| format_err!("flow trap: {}", trap))?;

        if !handled {
            trace!("main handler declined the request");
        }
        // An unhandled or uncompleted exchange falls back to the
        // channel's own 404/completion path.
        Ok(())
    }
}

/// A fully assembled server: compiled program, worker pool, listener.
pub struct Server {
    settings: Arc<Mutex<ServerSettings>>,
    acceptor: Arc<Scheduler>,
    pool: Arc<SchedulerPool>,
    listener: TcpListener,
}

impl Server {
    /// Compiles and links the configuration, runs its `setup` handler,
    /// applies overrides, and binds the listener. The accept loop is not
    /// entered until `run`.
    pub fn start(config_source: &str, config_name: &str, overrides: Overrides) -> Result<Server> {
        let settings = Arc::new(Mutex::new(ServerSettings::default()));
        let runtime = Arc::new(core_runtime(settings.clone()));

        let compilation = flow::compile(config_source, config_name, &runtime);
        for diagnostic in compilation.report.diagnostics() {
            if diagnostic.kind.is_error() {
                error!("{}", diagnostic);
            } else {
                warn!("{}", diagnostic);
            }
        }
        let program = match compilation.program {
            Some(program) => Arc::new(program),
            None => return Err(format_err!("configuration failed to compile")),
        };

        if program.find_handler("main").is_none() {
            return Err(format_err!(
                "configuration defines no 'main' handler"
            ));
        }

        // Boot-time configuration runs once, against the settings.
        if program.find_handler("setup").is_some() {
            let mut context = ();
            let setup_context: &mut dyn Any = &mut context;
            flow::vm::run_named(&program, &runtime, "setup", setup_context)
                .map_err(|trap| format_err!("setup handler trapped: {}", trap))?;
        }

        {
            let mut settings = settings.lock().unwrap();
            if let Some(listen) = overrides.listen {
                settings.listen = listen;
            }
            if let Some(workers) = overrides.workers {
                settings.workers = workers.max(1);
            }
        }

        let (listen_addr, workers, channel_config) = {
            let settings = settings.lock().unwrap();
            let channel_config = ChannelConfig {
                max_request_count: settings.max_request_count,
                max_keep_alive: settings.max_keep_alive,
                ..Default::default()
            };
            (settings.listen, settings.workers, channel_config)
        };

        let acceptor = Arc::new(Scheduler::new()?);
        let pool = Arc::new(SchedulerPool::new(workers)?);

        let handler: Arc<dyn HttpHandler> = Arc::new(FlowHandler {
            program,
            runtime,
        });
        let factory = Http1Connection::factory(
            Arc::new(channel_config),
            ParserLimits::default(),
            Arc::new(DateSource::new()),
            handler,
        );

        let selector_pool = pool.clone();
        let selector: SchedulerSelector = Arc::new(move || selector_pool.select());

        let listener = TcpListener::bind(
            listen_addr,
            acceptor.clone(),
            selector,
            factory,
            ListenerOptions {
                reuse_addr: true,
                multi_accept: 16,
                ..Default::default()
            },
        )?;
        listener.start();

        info!(
            "x0d serving on {} with {} worker(s)",
            listener.local_addr(),
            workers
        );

        Ok(Server {
            settings,
            acceptor,
            pool,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Runs the accept loop on the calling thread until `shutdown`.
    pub fn run(&self) {
        self.acceptor.run_loop();
    }

    /// Stops accepting, interrupts the accept loop, and winds down the
    /// worker pool.
    pub fn shutdown(&self) {
        self.listener.close();
        self.acceptor.break_loop();
        self.pool.shutdown();
    }
}

/// Compiles the configuration and renders the program listing
/// (`--dump-program`).
pub fn dump_program(config_source: &str, config_name: &str) -> Result<String> {
    let settings = Arc::new(Mutex::new(ServerSettings::default()));
    let runtime = core_runtime(settings);

    let compilation = flow::compile(config_source, config_name, &runtime);
    match compilation.program {
        Some(program) => Ok(program.dump()),
        None => {
            let mut message = String::from("configuration failed to compile:\n");
            for diagnostic in compilation.report.diagnostics() {
                message.push_str(&format!("  {}\n", diagnostic));
            }
            Err(err_msg(message))
        }
    }
}
