//! Default command handlers

use chrono::Local;
use serde_json::{Map, Value};

use super::CommandContext;
use crate::protocol::{Envelope, NodeInfo, DATE_FORMAT, TIME_FORMAT};

/// Render a display line:
/// `<date> <time> [<name>@][<ip>:<port> ]> <message>`
pub fn format_line(date: &str, time: &str, args: &Map<String, Value>, envelope: &Envelope) -> String {
    let mut line = format!("{} {} ", date, time);

    if let Some(name) = &envelope.name_client {
        line.push_str(name);
        line.push('@');
    }

    if let (Some(ip), Some(port)) = (&envelope.ip, envelope.port) {
        line.push_str(&format!("{}:{} ", ip, port));
    }

    line.push_str("> ");

    if let Some(message) = args.get("message").and_then(Value::as_str) {
        line.push_str(message);
    }

    line
}

fn render(args: &Map<String, Value>, envelope: &Envelope) -> String {
    let now = Local::now();
    format_line(
        &now.format(DATE_FORMAT).to_string(),
        &now.format(TIME_FORMAT).to_string(),
        args,
        envelope,
    )
}

/// Refresh the sender's registry entry if the envelope carries an identity
fn remember_sender(ctx: &mut CommandContext<'_>, envelope: &Envelope) {
    if envelope.name_client.is_none() {
        return;
    }
    if let Some(info) = NodeInfo::from_envelope(envelope) {
        ctx.registry.upsert(info);
        ctx.controller.update_infos(&*ctx.registry);
    }
}

pub fn print_message(ctx: &mut CommandContext<'_>, args: &Map<String, Value>, envelope: &Envelope) {
    let line = render(args, envelope);
    ctx.controller.add_client_message(line);
}

pub fn print_status(ctx: &mut CommandContext<'_>, args: &Map<String, Value>, envelope: &Envelope) {
    remember_sender(ctx, envelope);
    let line = render(args, envelope);
    ctx.controller.add_status_message(line);
}

pub fn print_error(ctx: &mut CommandContext<'_>, args: &Map<String, Value>, envelope: &Envelope) {
    let line = render(args, envelope);
    ctx.controller.add_error_message(line);
}

pub fn process_identify(ctx: &mut CommandContext<'_>, _args: &Map<String, Value>, envelope: &Envelope) {
    match NodeInfo::from_envelope(envelope) {
        Some(info) => {
            tracing::debug!("Node {} identified at {}:{}", info.name, info.ip, info.port);
            ctx.registry.upsert(info);
            ctx.controller.update_infos(&*ctx.registry);
        }
        None => tracing::debug!("Identify without origin address, registry untouched"),
    }
    ctx.controller.add_identify(envelope);
}

pub fn process_peers_list(ctx: &mut CommandContext<'_>, _args: &Map<String, Value>, envelope: &Envelope) {
    if let Some(peers) = &envelope.peers {
        ctx.controller.add_peer_list(peers.clone());
    }
}

pub fn send_message_to(ctx: &mut CommandContext<'_>, _args: &Map<String, Value>, envelope: &Envelope) {
    if let (Some(from), Some(to), Some(message)) = (&envelope.from, &envelope.to, &envelope.message) {
        ctx.controller
            .send_message_to(from.clone(), to.clone(), message.clone());
    }
}
