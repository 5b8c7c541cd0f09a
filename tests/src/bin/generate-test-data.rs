use chrono::{Duration, TimeZone, Utc};
use rand::{seq::SliceRandom, Rng};

const NUM_USERS: usize = 5;
const ROLES: &[&str] = &["member", "reviewer"];
const TARGETS: &[(&str, usize)] = &[("orders", 20), ("invoices", 10)];

const NUM_COMMENTS: usize = 300;
const REPLY_PERCENT: u32 = 40;
const MENTION_PERCENT: u32 = 20;
const CHANGELOG_PERCENT: u32 = 10;
const COMMENT_WORD_COUNT: usize = 25;

const PASSWORD: &str = "password";

fn gen_n_items(table: &str, columns: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    if n == 0 {
        return;
    }
    println!("INSERT INTO {table} ({columns}) VALUES");
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct Comment {
    author: Option<usize>,
    parent: Option<usize>,
    mentions: Option<usize>,
}

fn main() {
    let mut rng = rand::thread_rng();
    let hash = bcrypt::hash(PASSWORD, 4).expect("hashing the test password");
    let start = Utc
        .with_ymd_and_hms(2022, 1, 1, 0, 0, 0)
        .single()
        .expect("start date is valid");

    // Users, the first one being the root user
    let names = (0..NUM_USERS)
        .map(|i| match i {
            0 => String::from("root"),
            i => format!("{}{i}", lipsum::lipsum_words(1).to_lowercase().replace(|c: char| !c.is_alphanumeric(), "")),
        })
        .collect::<Vec<_>>();
    gen_n_items("users", "id, username, nickname, password", NUM_USERS, |i| {
        format!(
            "({}, {}, {}, {})",
            i + 1,
            quote(&names[i]),
            quote(&lipsum::lipsum_title()),
            quote(&hash)
        )
    });
    gen_n_items("users_roles", "user_id, role_name", NUM_USERS, |i| {
        let role = if i == 0 { "root" } else { ROLES[i % ROLES.len()] };
        format!("({}, {})", i + 1, quote(role))
    });

    // Members can read and write, reviewers can also moderate
    let grants = [
        ("list", "member"),
        ("create", "member"),
        ("list", "reviewer"),
        ("create", "reviewer"),
        ("update", "reviewer"),
        ("destroy", "reviewer"),
    ];
    gen_n_items(
        "permissions",
        "resource, action, role_name, allow",
        grants.len(),
        |i| format!("('comments', {}, {}, true)", quote(grants[i].0), quote(grants[i].1)),
    );

    // Comments, replies only ever point to earlier comments on the same record
    let mut comments: Vec<Comment> = Vec::new();
    let mut on_target: Vec<Vec<usize>> = Vec::new();
    let targets = TARGETS
        .iter()
        .flat_map(|(c, n)| (1..=*n).map(move |i| (*c, i)))
        .collect::<Vec<_>>();
    gen_n_items(
        "comments",
        "id, author_id, target_collection, target_id, content, parent_id, type, metadata, created_at, updated_at",
        NUM_COMMENTS,
        |i| {
            let t = rng.gen_range(0..targets.len());
            on_target.resize_with(targets.len(), Vec::new);
            let (collection, target_id) = targets[t];
            let date = start + Duration::minutes(i as i64 * 17);
            let id = i + 1;

            if rng.gen_ratio(CHANGELOG_PERCENT, 100) {
                comments.push(Comment { author: None, parent: None, mentions: None });
                on_target[t].push(id);
                return format!(
                    "({id}, NULL, {}, '{target_id}', 'changed status from **open** to **closed**', NULL, 'changelog', \
                     '{{\"action\": \"status_changed\", \"oldValue\": \"open\", \"newValue\": \"closed\"}}', '{date}', '{date}')",
                    quote(collection),
                );
            }

            let author = rng.gen_range(0..NUM_USERS);
            let parent = match rng.gen_ratio(REPLY_PERCENT, 100) {
                true => on_target[t].choose(&mut rng).copied(),
                false => None,
            };
            let mentions = rng
                .gen_ratio(MENTION_PERCENT, 100)
                .then(|| rng.gen_range(0..NUM_USERS))
                .filter(|m| *m != author);
            let mut content = lipsum::lipsum_words(COMMENT_WORD_COUNT);
            if let Some(m) = mentions {
                content = format!("@{} {content}", names[m]);
            }
            comments.push(Comment { author: Some(author), parent, mentions });
            on_target[t].push(id);
            format!(
                "({id}, {}, {}, '{target_id}', {}, {}, 'comment', NULL, '{date}', '{date}')",
                author + 1,
                quote(collection),
                quote(&content),
                parent.map_or(String::from("NULL"), |p| p.to_string()),
            )
        },
    );

    // Notifications that creating the above comments would have fanned out
    let mut notifications = Vec::new();
    for (i, c) in comments.iter().enumerate() {
        let Some(author) = c.author else { continue };
        if let Some(m) = c.mentions {
            notifications.push((m, i + 1, "mention"));
        }
        if let Some(parent_author) = c.parent.and_then(|p| comments[p - 1].author) {
            if parent_author != author {
                notifications.push((parent_author, i + 1, "reply"));
            }
        }
    }
    gen_n_items(
        "comment_notifications",
        "user_id, comment_id, type, is_read, created_at",
        notifications.len(),
        |i| {
            let (user, comment, kind) = notifications[i];
            let date = start + Duration::minutes((comment as i64 - 1) * 17);
            format!("({}, {comment}, '{kind}', {}, '{date}')", user + 1, rng.gen_bool(0.5))
        },
    );

    // Keep sequences in line with the explicit ids above
    for table in ["users", "comments"] {
        println!("SELECT setval('{table}_id_seq', (SELECT MAX(id) FROM {table}));");
    }
}
