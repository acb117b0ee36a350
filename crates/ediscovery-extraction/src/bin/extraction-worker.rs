//! Default extraction worker process: speaks the stdin/stdout protocol in
//! [`ediscovery_extraction::worker_protocol`] over a plain-text-only facade.
//! A deployment wiring in real PDF/office-document extractors ships its own
//! binary built the same way, registering those extractors on the facade
//! before calling [`run_worker_loop`].

use ediscovery_extraction::worker_protocol::run_worker_loop;
use ediscovery_extraction::ExtractionFacade;

fn main() -> std::io::Result<()> {
    let facade = ExtractionFacade::plain_text_only();
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_worker_loop(&facade, stdin.lock(), stdout.lock())
}
