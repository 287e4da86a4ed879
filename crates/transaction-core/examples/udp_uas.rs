/**
 * UDP UAS Example
 *
 * A minimal user agent server on top of the transaction layer:
 *
 * 1. Binds a UDP transport (default 127.0.0.1:5060, or the first argument)
 * 2. Registers a TU that wants transaction termination notices
 * 3. Answers OPTIONS with 200 OK and INVITE with 486 Busy Here
 * 4. Lets the stack handle retransmissions, 100 Trying and ACK absorption
 *
 * Try it with any SIP client, e.g. `sipsak -s sip:test@127.0.0.1`.
 *
 * To run this example with full logging:
 * ```
 * RUST_LOG=rvoip_stack_transaction=debug cargo run --example udp_uas
 * ```
 */

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, Level};

use rvoip_stack_transaction::prelude::*;
use rvoip_stack_transaction::{setup_logging, LoggingConfig};
use rvoip_stack_transport::message::make_response;
use rvoip_stack_transport::HickoryResolver;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(LoggingConfig::new(Level::INFO, "udp_uas"))?;

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5060".to_string())
        .parse()
        .map_err(|e| Error::config(format!("bad listen address: {}", e)))?;

    let resolver = Arc::new(HickoryResolver::from_system_conf()?);
    let (stack, _unclaimed) = SipStack::new(StackConfig::default(), resolver)?;
    let local = stack.bind_udp(addr).await?;
    info!("UAS listening on {}", local);

    let registration = TuRegistration::new("udp-uas").with_transaction_termination();
    let (_tu, mut messages) = stack.register_transaction_user(registration)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = messages.recv() => match msg {
                Some(TuMessage::Sip(request)) if request.is_request() => {
                    let code = match request.method() {
                        Method::Invite => 486,
                        Method::Ack => continue,
                        _ => 200,
                    };
                    info!("{} -> {}", request.brief(), code);
                    stack.send(make_response(&request, code, None))?;
                }
                Some(TuMessage::TransactionTerminated { transaction_id, .. }) => {
                    info!("transaction {} finished", transaction_id);
                }
                Some(other) => info!("ignoring {:?}", other),
                None => break,
            },
        }
    }

    stack.shutdown().await;
    Ok(())
}
