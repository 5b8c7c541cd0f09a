use std::{sync::Arc, time::Duration};

use anyhow::Context;
use remark_client::{
    api::{
        AuthToken, CommentId, NewChangelog, NewPermission, NewSession, NewUser, NotificationId,
        Target, UserId, Uuid, COMMENTS_RESOURCE,
    },
    Client, CommentThread, NotificationInbox, POLL_INTERVAL,
};
use structopt::StructOpt;

mod http;

use http::HttpBackend;

#[derive(StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    /// Session token, as printed by `login`
    #[structopt(long, env = "REMARK_TOKEN")]
    token: Option<Uuid>,

    /// Role to claim through the x-role header
    #[structopt(long)]
    role: Option<String>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Create a user
    CreateUser {
        /// Username
        name: String,

        /// Initial password
        initial_password: String,

        #[structopt(long)]
        nickname: Option<String>,

        /// Roles given to the user
        #[structopt(long = "with-role")]
        roles: Vec<String>,
    },

    /// Add a permission row, granting or denying a comment action
    Grant {
        /// Action name, like `list` or `comments:list`
        action: String,

        #[structopt(long = "to-role")]
        role_name: Option<String>,

        #[structopt(long = "to-user")]
        user_id: Option<i64>,

        #[structopt(long)]
        deny: bool,
    },

    /// Open a session and print its token
    Login {
        user: String,
        password: String,

        #[structopt(long, default_value = "remark-ctl")]
        device: String,
    },

    /// Close the current session
    Logout,

    /// Print the comments on a record, threaded
    Thread { collection: String, id: String },

    /// Comment on a record
    Post {
        collection: String,
        id: String,
        content: String,

        /// Comment being replied to
        #[structopt(long)]
        parent: Option<i64>,
    },

    Edit { comment: i64, content: String },

    Delete { comment: i64 },

    /// Record a system-authored change on a record
    Changelog {
        collection: String,
        id: String,

        /// created, updated, deleted, status_changed or free-form
        action: String,

        #[structopt(long)]
        field: Option<String>,

        /// Previous value, as json
        #[structopt(long)]
        old: Option<String>,

        /// New value, as json
        #[structopt(long)]
        new: Option<String>,
    },

    /// List all comments including hidden ones, optionally on a single record
    RawList {
        collection: Option<String>,
        id: Option<String>,
    },

    /// Dump the permission rows about comments
    Permissions,

    /// Recompile the server's access control snapshot
    ReloadAcl,

    /// List notifications, newest first
    Notifications {
        /// Keep polling, printing the unread count on every change
        #[structopt(long)]
        watch: bool,

        /// Polling period in seconds, defaults to 30
        #[structopt(long)]
        period: Option<u64>,
    },

    MarkRead { notification: i64 },

    MarkAllRead,
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

fn parse_json(v: Option<String>) -> anyhow::Result<Option<serde_json::Value>> {
    v.map(|v| serde_json::from_str(&v).with_context(|| format!("parsing {v:?} as json")))
        .transpose()
}

fn print_json<T: serde::Serialize>(v: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(v).context("serializing server response")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opt = Opt::from_args();

    let http = reqwest::Client::new();
    let client = Client::new(Arc::new(HttpBackend {
        client: http.clone(),
        host: opt.host.clone(),
        token: opt.token.map(AuthToken),
        role: opt.role.clone(),
    }));

    match opt.cmd {
        Command::CreateUser {
            name,
            initial_password,
            nickname,
            roles,
        } => {
            let id: UserId = http
                .post(format!("{}/api/admin/create-user", opt.host))
                .json(&NewUser::new(name, nickname, initial_password, roles))
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("created user {}", id.0);
        }
        Command::Grant {
            action,
            role_name,
            user_id,
            deny,
        } => {
            http.post(format!("{}/api/admin/grant-permission", opt.host))
                .json(&NewPermission {
                    resource: String::from(COMMENTS_RESOURCE),
                    action,
                    role_name,
                    user_id: user_id.map(UserId),
                    allow: !deny,
                })
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?;
        }
        Command::Login {
            user,
            password,
            device,
        } => {
            let token: AuthToken = http
                .post(format!("{}/api/auth", opt.host))
                .json(&NewSession {
                    user,
                    password,
                    device,
                })
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", token.0);
        }
        Command::Logout => {
            let token = opt.token.context("logging out requires a session token")?;
            http.post(format!("{}/api/unauth", opt.host))
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?;
        }
        Command::Thread { collection, id } => {
            let thread = CommentThread::new(client, Target::new(collection, id));
            thread.refresh().await?;
            for (depth, c) in thread.tree().await.walk() {
                let author = c.author.as_ref().map_or("system", |a| a.display_name());
                let edited = if c.is_edited { " (edited)" } else { "" };
                println!(
                    "{:indent$}#{} {author}{edited}: {}",
                    "",
                    c.id,
                    c.content,
                    indent = depth * 2
                );
            }
        }
        Command::Post {
            collection,
            id,
            content,
            parent,
        } => {
            let c = client
                .create(&Target::new(collection, id), &content, parent.map(CommentId))
                .await?;
            println!("posted comment {}", c.id);
        }
        Command::Edit { comment, content } => {
            print_json(&client.update(CommentId(comment), &content).await?)?;
        }
        Command::Delete { comment } => {
            print_json(&client.destroy(CommentId(comment)).await?)?;
        }
        Command::Changelog {
            collection,
            id,
            action,
            field,
            old,
            new,
        } => {
            let changelog = NewChangelog {
                target_collection: collection,
                target_id: id,
                action: action.into(),
                field,
                old_value: parse_json(old)?,
                new_value: parse_json(new)?,
            };
            print_json(&client.create_changelog(&changelog).await?)?;
        }
        Command::RawList { collection, id } => {
            let target = match (collection, id) {
                (Some(c), Some(i)) => Some(Target::new(c, i)),
                (None, None) => None,
                _ => anyhow::bail!("raw-list takes either no argument or both a collection and an id"),
            };
            print_json(&client.raw_list(target.as_ref()).await?)?;
        }
        Command::Permissions => print_json(&client.debug_permissions().await?)?,
        Command::ReloadAcl => print_json(&client.reload_acl().await?)?,
        Command::Notifications { watch, period } => {
            let inbox = NotificationInbox::new(client);
            if watch {
                let period = period.map_or(POLL_INTERVAL, Duration::from_secs);
                let mut last = None;
                inbox
                    .watch(period, |items| {
                        let unread = items.iter().filter(|n| !n.is_read).count();
                        if last != Some(unread) {
                            println!("{unread} unread notification(s)");
                            last = Some(unread);
                        }
                    })
                    .await;
            } else {
                inbox.refresh().await?;
                print_json(&inbox.items().await)?;
            }
        }
        Command::MarkRead { notification } => {
            print_json(&client.mark_read(NotificationId(notification)).await?)?;
        }
        Command::MarkAllRead => print_json(&client.mark_all_read().await?)?,
    }

    Ok(())
}
