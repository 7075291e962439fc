use anyhow::Context;
use ccnd::forwarder::Ccnd;
use ccnd::io::EventLoop;
use log::info;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

const DEFAULT_PORT: &str = "4485";
const SOCK_NAME: &str = "ccnd.sock";

static FATAL_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_fatal_signal(sig: libc::c_int) {
    FATAL_SIGNAL.store(sig, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    let debug = env::var("CCND_DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    env_logger::Builder::from_default_env()
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let port_str = env::var("CCN_LOCAL_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    let port: u16 = port_str
        .parse()
        .with_context(|| format!("CCN_LOCAL_PORT {port_str:?} is not a port number"))?;
    let sock_path = local_socket_path(&port_str);

    // A previous owner may still be holding the socket open; take the path
    //  away and give it a moment to notice and exit before rebinding.
    if std::fs::remove_file(&sock_path).is_ok() {
        info!(
            "removed existing socket {}, waiting for the previous owner",
            sock_path.display()
        );
        std::thread::sleep(Duration::from_secs(9));
    }

    unsafe {
        libc::signal(
            libc::SIGTERM,
            on_fatal_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            on_fatal_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            on_fatal_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let mut h = Ccnd::new();
    let mut event_loop = EventLoop::bind(&mut h, &sock_path, port)
        .with_context(|| format!("cannot create listener at {}", sock_path.display()))?;

    info!(
        "ccnd listening on {} and udp port {port}",
        sock_path.display()
    );

    let outcome = event_loop.run(&mut h, || {
        match FATAL_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    });

    let _ = std::fs::remove_file(&sock_path);

    match outcome {
        Ok(Some(sig)) => {
            info!("exiting on signal {sig}");
            std::process::exit(sig);
        }
        Ok(None) => {
            // The listener path disappeared under us; treat it as a
            //  request to go away quietly.
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn local_socket_path(port: &str) -> PathBuf {
    let name = if port == DEFAULT_PORT {
        SOCK_NAME.to_string()
    } else {
        format!("{SOCK_NAME}.{port}")
    };
    env::temp_dir().join(name)
}
