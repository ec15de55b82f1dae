use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flow::ast::{Literal, Type};
use flow::runtime::{Params, Runtime};
use flow::value::Value;
use http::channel::Channel;
use http::file_handler::StaticFileHandler;
use http::status_code::StatusCode;

/// Server-level settings, populated by the config's `setup` handler and
/// overridable from the command line.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub workers: usize,
    pub docroot: PathBuf,
    pub max_request_count: usize,
    pub max_keep_alive: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".parse().unwrap(),
            workers: 1,
            docroot: PathBuf::from("."),
            max_request_count: 100,
            max_keep_alive: Duration::from_secs(8),
        }
    }
}

/// Per-request scratch state kept on the channel: `resp.write` output is
/// buffered here so the final response can carry an exact
/// Content-Length.
#[derive(Default)]
struct RequestNotes {
    body: Vec<u8>,
}

fn with_channel(params: &mut Params, f: impl FnOnce(&mut Channel)) {
    match params.context.downcast_mut::<Channel>() {
        Some(channel) => f(channel),
        None => warn!("request-scope callback invoked outside a request"),
    }
}

fn with_settings(
    settings: &Arc<Mutex<ServerSettings>>,
    f: impl FnOnce(&mut ServerSettings),
) {
    f(&mut settings.lock().unwrap());
}

fn notes(channel: &mut Channel) -> &mut RequestNotes {
    if channel.custom_data.is_none() {
        channel.custom_data = Some(Box::new(RequestNotes::default()));
    }
    channel
        .custom_data
        .as_mut()
        .unwrap()
        .downcast_mut()
        .expect("request notes type")
}

/// Flushes the buffered body and finishes the response.
fn finish_response(channel: &mut Channel) {
    if channel.response_complete() {
        return;
    }

    let body = std::mem::take(&mut notes(channel).body);
    if !channel.response.is_committed() && !channel.response.has_content_length() {
        channel.response.set_content_length(body.len() as u64);
    }
    if !body.is_empty() {
        if let Err(e) = channel.send(&body) {
            debug!("finish: {}", e);
        }
    }
    channel.completed();
}

/// Builds the core native-callback registry the configuration links
/// against.
pub fn core_runtime(settings: Arc<Mutex<ServerSettings>>) -> Runtime {
    let mut runtime = Runtime::new();

    // {{{ setup-scope callbacks

    let s = settings.clone();
    runtime
        .register_function("listen", Type::Void)
        .param(Type::Number, "port")
        .verifier(Box::new(|call| match call.args[0].value.as_literal() {
            Some(Literal::Number(port)) if (1..=65535).contains(port) => Ok(()),
            Some(Literal::Number(port)) => {
                Err(format!("listen(): port {} out of range", port))
            }
            _ => Ok(()),
        }))
        .bind(Box::new(move |params| {
            let port = params.arg(0).as_number() as u16;
            with_settings(&s, |settings| settings.listen.set_port(port));
        }));

    let s = settings.clone();
    runtime
        .register_function("workers", Type::Void)
        .param(Type::Number, "count")
        .bind(Box::new(move |params| {
            let count = params.arg(0).as_number().max(1) as usize;
            with_settings(&s, |settings| settings.workers = count);
        }));

    let s = settings.clone();
    runtime
        .register_function("docroot", Type::Void)
        .param(Type::String, "path")
        .bind(Box::new(move |params| {
            let path = PathBuf::from(params.arg(0).as_str());
            with_settings(&s, |settings| settings.docroot = path.clone());
        }));

    let s = settings.clone();
    runtime
        .register_function("max_request_count", Type::Void)
        .param(Type::Number, "count")
        .bind(Box::new(move |params| {
            let count = params.arg(0).as_number().max(1) as usize;
            with_settings(&s, |settings| settings.max_request_count = count);
        }));

    let s = settings.clone();
    runtime
        .register_function("keepalive_timeout", Type::Void)
        .param(Type::Number, "seconds")
        .bind(Box::new(move |params| {
            let seconds = params.arg(0).as_number().max(0) as u64;
            with_settings(&s, |settings| {
                settings.max_keep_alive = Duration::from_secs(seconds)
            });
        }));

    // }}}
    // {{{ request inspection

    runtime
        .register_function("req.method", Type::String)
        .set_read_only()
        .bind(Box::new(|params| {
            let mut result = Value::Void;
            with_channel(params, |channel| {
                result = Value::String(channel.request.method.as_str().to_string());
            });
            params.set_result(result);
        }));

    runtime
        .register_function("req.path", Type::String)
        .set_read_only()
        .bind(Box::new(|params| {
            let mut result = Value::Void;
            with_channel(params, |channel| {
                result = Value::String(channel.request.path.clone());
            });
            params.set_result(result);
        }));

    runtime
        .register_function("req.query", Type::String)
        .set_read_only()
        .bind(Box::new(|params| {
            let mut result = Value::Void;
            with_channel(params, |channel| {
                result = Value::String(channel.request.query.clone());
            });
            params.set_result(result);
        }));

    runtime
        .register_function("req.host", Type::String)
        .set_read_only()
        .bind(Box::new(|params| {
            let mut result = Value::Void;
            with_channel(params, |channel| {
                result = Value::String(channel.request.host.clone());
            });
            params.set_result(result);
        }));

    runtime
        .register_function("req.header", Type::String)
        .param(Type::String, "name")
        .set_read_only()
        .bind(Box::new(|params| {
            let name = params.arg(0).as_str().to_string();
            let mut result = Value::Void;
            with_channel(params, |channel| {
                let value = channel.request.headers.get(&name).unwrap_or("");
                result = Value::String(value.to_string());
            });
            params.set_result(result);
        }));

    runtime
        .register_function("req.remoteip", Type::IPAddress)
        .set_read_only()
        .bind(Box::new(|params| {
            let mut result = Value::Void;
            with_channel(params, |channel| {
                result = Value::IP(channel.request.remote_ip);
            });
            params.set_result(result);
        }));

    let s = settings.clone();
    runtime
        .register_function("phys.path", Type::String)
        .set_read_only()
        .bind(Box::new(move |params| {
            let docroot = s.lock().unwrap().docroot.clone();
            let mut result = Value::Void;
            with_channel(params, |channel| {
                let relative = channel.request.path.trim_start_matches('/');
                result = Value::String(docroot.join(relative).to_string_lossy().into_owned());
            });
            params.set_result(result);
        }));

    // Lowered to a VM register read; never invoked at runtime.
    runtime
        .register_function("regex.group", Type::String)
        .param(Type::Number, "position")
        .set_read_only();

    // }}}
    // {{{ response production

    runtime
        .register_function("resp.status", Type::Void)
        .param(Type::Number, "code")
        .bind(Box::new(|params| {
            let code = params.arg(0).as_number();
            with_channel(params, |channel| {
                channel.response.status = StatusCode(code.clamp(100, 599) as u16);
            });
        }));

    runtime
        .register_function("resp.header", Type::Void)
        .param(Type::String, "name")
        .param(Type::String, "value")
        .bind(Box::new(|params| {
            let name = params.arg(0).as_str().to_string();
            let value = params.arg(1).as_str().to_string();
            with_channel(params, |channel| {
                channel.response.headers.overwrite(&name, value.clone());
            });
        }));

    runtime
        .register_function("resp.write", Type::Void)
        .param(Type::String, "content")
        .bind(Box::new(|params| {
            let content = params.arg(0).as_str().to_string();
            with_channel(params, |channel| {
                notes(channel).body.extend_from_slice(content.as_bytes());
            });
        }));

    runtime
        .register_function("log.info", Type::Void)
        .param(Type::String, "message")
        .bind(Box::new(|params| {
            info!("{}", params.arg(0));
        }));

    runtime.register_handler("return").bind(Box::new(|params| {
        with_channel(params, finish_response);
        params.set_handled(true);
    }));

    runtime
        .register_handler("respond")
        .param(Type::Number, "status")
        .bind(Box::new(|params| {
            let code = params.arg(0).as_number();
            with_channel(params, |channel| {
                channel.response.status = StatusCode(code.clamp(100, 599) as u16);
                finish_response(channel);
            });
            params.set_handled(true);
        }));

    let s = settings;
    runtime.register_handler("serve").bind(Box::new(move |params| {
        let docroot = s.lock().unwrap().docroot.clone();
        with_channel(params, |channel| {
            StaticFileHandler::new(docroot.clone()).handle(channel);
        });
        params.set_handled(true);
    }));

    // }}}

    runtime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_callbacks_mutate_settings() {
        let settings = Arc::new(Mutex::new(ServerSettings::default()));
        let runtime = core_runtime(settings.clone());

        let program = flow::compile(
            "handler setup { listen 9999; workers 3; docroot \"/srv/www\"; }",
            "test.conf",
            &runtime,
        );
        let program = program.program.expect("compiles");

        let mut context = ();
        flow::vm::run_named(&program, &runtime, "setup", &mut context).unwrap();

        let settings = settings.lock().unwrap();
        assert_eq!(settings.listen.port(), 9999);
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.docroot, PathBuf::from("/srv/www"));
    }

    #[test]
    fn listen_verifier_rejects_bad_ports() {
        let settings = Arc::new(Mutex::new(ServerSettings::default()));
        let runtime = core_runtime(settings);

        let compilation = flow::compile(
            "handler setup { listen 123456; }",
            "test.conf",
            &runtime,
        );
        assert!(compilation.program.is_none());
        assert!(compilation.report.has_errors());
    }

    #[test]
    fn core_signatures_are_linkable() {
        let settings = Arc::new(Mutex::new(ServerSettings::default()));
        let runtime = core_runtime(settings);

        let compilation = flow::compile(
            "handler main {\n\
               if req.path == \"/healthz\" {\n\
                 resp.status = 200;\n\
                 resp.write \"ok\\n\";\n\
                 return;\n\
               }\n\
               match req.path {\n\
                 on \"/static/\" serve;\n\
                 else respond 404;\n\
               }\n\
             }",
            "test.conf",
            &runtime,
        );
        assert!(
            compilation.program.is_some(),
            "diagnostics: {:?}",
            compilation.report.diagnostics()
        );
    }
}
