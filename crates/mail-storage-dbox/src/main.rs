mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mail_storage_core::{
    ListFlags, MailStorage, OpenFlags, StatusItems, StorageCallbacks, StorageError,
    StorageRegistry,
};
use mail_storage_dbox::DboxClass;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

/// Relays storage notices to the log.
struct LogCallbacks;

impl StorageCallbacks for LogCallbacks {
    fn notify_ok(&self, text: &str) {
        info!("{}", text);
    }

    fn notify_no(&self, text: &str) {
        warn!("{}", text);
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let settings = config.settings();

    // Sweeping is dbox maintenance, not a generic storage operation
    if let Command::Sweep { name } = &config.command {
        let storage = DboxClass::new().open(config.dbox_data(), &settings)?;
        storage.set_callbacks(Arc::new(LogCallbacks));
        let removed = storage.sweep_temp_files(name)?;
        println!("{}", removed);
        return Ok(());
    }

    let registry = StorageRegistry::new();
    registry.register(Arc::new(DboxClass::new()));

    let storage = registry
        .create_with_data(&config.mail_location, &settings)
        .with_context(|| format!("Failed to open mail storage {:?}", config.mail_location))?;
    storage.set_callbacks(Arc::new(LogCallbacks));
    info!("Using {} storage", storage.backend_name());

    run(storage.as_ref(), &config.command).map_err(|e| {
        // the storage's own text is what a user should see
        let (message, _) = storage.get_last_error();
        anyhow::anyhow!(message.unwrap_or_else(|| e.to_string()))
    })
}

fn run(storage: &dyn MailStorage, command: &Command) -> Result<(), StorageError> {
    match command {
        Command::Create { name, directory } => storage.mailbox_create(name, *directory),
        Command::Delete { name } => storage.mailbox_delete(name),
        Command::Rename { old_name, new_name } => storage.mailbox_rename(old_name, new_name),
        Command::List {
            mask,
            reference,
            subscribed,
        } => {
            let flags = ListFlags {
                subscribed_only: *subscribed,
                fast: false,
            };
            for info in storage.mailbox_list(reference, mask, flags)? {
                let mut attrs = Vec::new();
                if info.noselect {
                    attrs.push("\\Noselect");
                }
                match info.children {
                    Some(true) => attrs.push("\\HasChildren"),
                    Some(false) => attrs.push("\\HasNoChildren"),
                    None => {}
                }
                if info.subscribed {
                    attrs.push("\\Subscribed");
                }
                println!("({}) \"{}\" {}", attrs.join(" "), storage.hierarchy_sep(), info.name);
            }
            Ok(())
        }
        Command::Status { name } => {
            let flags = OpenFlags {
                readonly: true,
                ..Default::default()
            };
            let mut mailbox = storage.open(name, None, flags)?;
            let status = mailbox.status(StatusItems::all())?;
            mailbox.close()?;
            match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to format status: {}", e),
            }
            Ok(())
        }
        Command::Subscribe { name } => storage.set_subscribed(name, true),
        Command::Unsubscribe { name } => storage.set_subscribed(name, false),
        // handled before the registry is involved
        Command::Sweep { .. } => Ok(()),
    }
}
