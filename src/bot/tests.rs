use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use teloxide::{
    types::{ChatMember, Update},
    utils::command::BotCommands,
};

use super::{counts_as_joined, parse_create_code, reply, Command, Telegram};
use crate::{
    conf::ConfTelegram,
    data::{Ledger, MemoryStore},
    dispatch::Dispatcher,
    lookup::{Endpoints, LookupType},
};

const ADMIN: i64 = 1;
const GROUP: i64 = -100;

#[test]
fn commands_parse() {
    let parse = |s| Command::parse(s, "ferretbot").ok();
    assert_eq!(parse("/redeem GIFT1"), Some(Command::Redeem("GIFT1".to_string())));
    assert_eq!(
        parse("/createcode X 5"),
        Some(Command::CreateCode("X 5".to_string()))
    );
    assert_eq!(parse("/stats@ferretbot"), Some(Command::Stats));
    assert!(matches!(parse("/start"), Some(Command::Start(_))));
    assert_eq!(parse("hello"), None);
    assert_eq!(parse("/stats@otherbot"), None);
}

#[test]
fn admin_commands_are_marked() {
    assert!(Command::Stats.is_admin_only());
    assert!(Command::Broadcast(String::new()).is_admin_only());
    assert!(Command::CreateCode(String::new()).is_admin_only());
    assert!(!Command::Redeem(String::new()).is_admin_only());
    assert!(!Command::Usage.is_admin_only());
}

#[test]
fn create_code_arguments() {
    assert_eq!(parse_create_code("GIFT 3"), Some(("GIFT".to_string(), 3)));
    assert_eq!(parse_create_code("GIFT"), Some(("GIFT".to_string(), 1)));
    assert_eq!(parse_create_code("GIFT 0"), Some(("GIFT".to_string(), 1)));
    assert_eq!(parse_create_code("GIFT x"), Some(("GIFT".to_string(), 1)));
    assert_eq!(parse_create_code("GIFT -2"), Some(("GIFT".to_string(), 1)));
    assert_eq!(parse_create_code("   "), None);
}

#[test]
fn only_members_and_above_count_as_joined() {
    let member = |status: Value| -> ChatMember {
        let mut value = json!({"user": user_json(42)});
        value
            .as_object_mut()
            .unwrap()
            .extend(status.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    };

    let plain = member(json!({"status": "member"}));
    assert!(counts_as_joined(&plain.kind));

    let left = member(json!({"status": "left"}));
    assert!(!counts_as_joined(&left.kind));

    let banned = member(json!({"status": "kicked", "until_date": 0}));
    assert!(!counts_as_joined(&banned.kind));

    let restricted = member(json!({
        "status": "restricted",
        "until_date": 0,
        "is_member": true,
        "can_send_messages": false,
        "can_send_audios": false,
        "can_send_documents": false,
        "can_send_photos": false,
        "can_send_videos": false,
        "can_send_video_notes": false,
        "can_send_voice_notes": false,
        "can_send_polls": false,
        "can_send_other_messages": false,
        "can_add_web_page_previews": false,
        "can_change_info": false,
        "can_invite_users": false,
        "can_pin_messages": false,
        "can_manage_topics": false
    }));
    assert!(!counts_as_joined(&restricted.kind));
}

/// Which chats the fake Bot API refuses, as Telegram does for a user who
/// blocked the bot.
#[derive(Clone, Copy)]
enum Refuse {
    Nobody,
    Chat(i64),
    Everyone,
}

struct BotApi {
    refuse: Refuse,
    calls: Mutex<Vec<(String, Value)>>,
}

async fn bot_api_method(
    State(api): State<Arc<BotApi>>,
    Path((_bot, method)): Path<(String, String)>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let method = method.to_ascii_lowercase();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let chat_id = payload["chat_id"].as_i64();
    api.calls.lock().unwrap().push((method.clone(), payload));
    let refused = match api.refuse {
        Refuse::Nobody => false,
        Refuse::Chat(id) => chat_id == Some(id),
        Refuse::Everyone => true,
    };
    if refused {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })),
        );
    }
    let result = match method.as_str() {
        "sendmessage" => json!({
            "message_id": 1,
            "date": 1_700_000_000,
            "chat": chat_json(chat_id.unwrap_or(ADMIN)),
            "text": "ok"
        }),
        _ => json!(true),
    };
    (StatusCode::OK, Json(json!({"ok": true, "result": result})))
}

struct Harness {
    telegram: Telegram,
    ledger: Arc<Ledger>,
    api: Arc<BotApi>,
    upstream_hits: Arc<AtomicUsize>,
}

impl Harness {
    async fn new(upstream_status: StatusCode, refuse: Refuse) -> Self {
        let upstream_hits = Arc::new(AtomicUsize::new(0));
        let upstream = Router::new().route(
            "/",
            get({
                let hits = upstream_hits.clone();
                move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (
                            upstream_status,
                            Json(json!({"plate": "MH12AB1234", "owner": "@brand"})),
                        )
                    }
                }
            }),
        );
        let upstream_addr = serve(upstream).await;

        let api = Arc::new(BotApi {
            refuse,
            calls: Mutex::new(Vec::new()),
        });
        let bot_api = Router::new()
            .route("/:bot/:method", post(bot_api_method))
            .with_state(api.clone());
        let bot_api_addr = serve(bot_api).await;

        let overrides = BTreeMap::from([(
            "rc".to_string(),
            format!("http://{upstream_addr}/"),
        )]);
        let dispatcher = Arc::new(
            Dispatcher::new(
                Endpoints::new(&overrides).unwrap(),
                Some(Duration::from_secs(5)),
            )
            .unwrap(),
        );
        let ledger = Arc::new(Ledger::new(MemoryStore::default(), 10));
        let conf = ConfTelegram {
            bot_token: "123456:TEST".to_string(),
            admin_id: ADMIN,
            api_url: Some(format!("http://{bot_api_addr}/")),
            ..ConfTelegram::default()
        };
        let telegram =
            Telegram::new(conf, dispatcher, ledger.clone(), "tester".to_string())
                .unwrap();
        Self {
            telegram,
            ledger,
            api,
            upstream_hits,
        }
    }

    async fn text(&self, chat: i64, user: i64, text: &str) -> anyhow::Result<()> {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "date": 1_700_000_000,
                "chat": chat_json(chat),
                "from": user_json(user),
                "text": text
            }
        });
        self.telegram
            .handle_update(serde_json::from_str::<Update>(&update.to_string()).unwrap())
            .await
    }

    async fn press(&self, chat: i64, user: i64, data: &str) -> anyhow::Result<()> {
        let update = json!({
            "update_id": 2,
            "callback_query": {
                "id": "cb-1",
                "from": user_json(user),
                "chat_instance": "ci-1",
                "data": data,
                "message": {
                    "message_id": 9,
                    "date": 1_700_000_000,
                    "chat": chat_json(chat),
                    "text": "menu"
                }
            }
        });
        self.telegram
            .handle_update(serde_json::from_str::<Update>(&update.to_string()).unwrap())
            .await
    }

    /// Texts sent to `chat`, oldest first.
    fn sent_to(&self, chat: i64) -> Vec<String> {
        self.api
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, payload)| {
                method == "sendmessage" && payload["chat_id"].as_i64() == Some(chat)
            })
            .filter_map(|(_, payload)| payload["text"].as_str().map(str::to_string))
            .collect()
    }

    fn calls_of(&self, method: &str) -> usize {
        self.api
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    fn hits(&self) -> usize {
        self.upstream_hits.load(Ordering::SeqCst)
    }

    async fn used_today(&self, uid: i64) -> u32 {
        self.ledger.usage(uid).await.unwrap().used_today
    }
}

async fn serve(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

fn user_json(id: i64) -> Value {
    json!({"id": id, "is_bot": false, "first_name": "Tester"})
}

fn chat_json(id: i64) -> Value {
    if id < 0 {
        json!({"id": id, "type": "supergroup", "title": "Lookups"})
    } else {
        json!({"id": id, "type": "private", "first_name": "Tester"})
    }
}

#[tokio::test]
async fn pending_lookup_belongs_to_whoever_pressed() {
    let h = Harness::new(StatusCode::OK, Refuse::Nobody).await;

    h.press(GROUP, 7, "type_rc").await.unwrap();
    assert_eq!(h.calls_of("answercallbackquery"), 1);
    assert_eq!(h.sent_to(GROUP), [reply::ask_for_term(LookupType::Rc)]);

    h.text(GROUP, 8, "MH12AB1234").await.unwrap();
    assert_eq!(h.hits(), 0);
    assert_eq!(h.sent_to(GROUP).len(), 1);

    h.text(GROUP, 7, "MH12AB1234").await.unwrap();
    assert_eq!(h.hits(), 1);
    let sent = h.sent_to(GROUP);
    assert_eq!(sent.len(), 2);
    assert!(sent[1].starts_with("<pre>"));
    assert!(sent[1].contains("MH12AB1234"));
    assert!(sent[1].contains("tester"));
    assert!(!sent[1].contains("@brand"));

    // Group chats are not charged.
    assert_eq!(h.used_today(7).await, 0);
}

#[tokio::test]
async fn private_lookup_is_charged_after_success() {
    let h = Harness::new(StatusCode::OK, Refuse::Nobody).await;

    h.press(42, 42, "type_rc").await.unwrap();
    assert_eq!(h.used_today(42).await, 0);
    h.text(42, 42, "MH12AB1234").await.unwrap();

    assert_eq!(h.hits(), 1);
    assert_eq!(h.used_today(42).await, 1);
    assert!(h.sent_to(42).last().unwrap().starts_with("<pre>"));
}

#[tokio::test]
async fn upstream_failure_is_generic_and_free() {
    let h = Harness::new(StatusCode::INTERNAL_SERVER_ERROR, Refuse::Nobody).await;

    h.press(42, 42, "type_rc").await.unwrap();
    h.text(42, 42, "MH12AB1234").await.unwrap();

    assert_eq!(h.hits(), 1);
    assert_eq!(h.used_today(42).await, 0);
    let sent = h.sent_to(42);
    assert_eq!(sent.last().map(String::as_str), Some(reply::FETCH_FAILED));
    assert!(sent.iter().all(|text| !text.contains("500")));
}

#[tokio::test]
async fn exhausted_quota_stops_the_button() {
    let h = Harness::new(StatusCode::OK, Refuse::Nobody).await;
    for _ in 0..10 {
        h.ledger.record_use(42).await.unwrap();
    }

    h.press(42, 42, "type_rc").await.unwrap();
    assert_eq!(h.sent_to(42), [reply::LIMIT_REACHED]);

    h.text(42, 42, "MH12AB1234").await.unwrap();
    assert_eq!(h.sent_to(42).last().map(String::as_str), Some(reply::NOTHING_PENDING));
    assert_eq!(h.hits(), 0);
}

#[tokio::test]
async fn quota_is_checked_again_before_dispatch() {
    let h = Harness::new(StatusCode::OK, Refuse::Nobody).await;
    for _ in 0..9 {
        h.ledger.record_use(42).await.unwrap();
    }

    h.press(42, 42, "type_rc").await.unwrap();
    assert_eq!(h.sent_to(42), [reply::ask_for_term(LookupType::Rc)]);
    // Spent elsewhere while the term was being typed.
    h.ledger.record_use(42).await.unwrap();

    h.text(42, 42, "MH12AB1234").await.unwrap();
    assert_eq!(h.sent_to(42).last().map(String::as_str), Some(reply::LIMIT_REACHED));
    assert_eq!(h.hits(), 0);
    assert_eq!(h.used_today(42).await, 10);
}

#[tokio::test]
async fn admin_commands_refuse_other_users() {
    let h = Harness::new(StatusCode::OK, Refuse::Nobody).await;

    h.text(42, 42, "/stats").await.unwrap();
    assert_eq!(h.sent_to(42), [reply::UNAUTHORIZED]);

    h.text(42, 42, "/createcode FREE 5").await.unwrap();
    assert_eq!(h.sent_to(42).last().map(String::as_str), Some(reply::UNAUTHORIZED));
    assert_eq!(h.ledger.stats().await.unwrap().live_codes, 0);

    h.text(ADMIN, ADMIN, "/stats").await.unwrap();
    assert!(h.sent_to(ADMIN)[0].starts_with("📊 Users:"));
}

#[tokio::test]
async fn broadcast_tallies_refusals() {
    let h = Harness::new(StatusCode::OK, Refuse::Chat(8)).await;
    for uid in [ADMIN, 7, 8] {
        h.ledger.register(uid).await.unwrap();
    }

    h.text(ADMIN, ADMIN, "/broadcast maintenance at noon").await.unwrap();

    assert_eq!(h.sent_to(7), ["maintenance at noon"]);
    assert_eq!(
        h.sent_to(ADMIN).last().map(String::as_str),
        Some("✅ Broadcast sent! Delivered: 2, failed: 1.")
    );
}

#[tokio::test]
async fn refused_replies_do_not_fail_the_update() {
    let h = Harness::new(StatusCode::OK, Refuse::Everyone).await;

    h.press(42, 42, "type_rc").await.unwrap();
    let answered = h.text(42, 42, "MH12AB1234").await;

    assert!(answered.is_ok(), "{answered:?}");
    assert_eq!(h.hits(), 1);
    assert_eq!(h.used_today(42).await, 1);

    assert!(h.text(42, 42, "/start").await.is_ok());
    assert!(h.text(42, 42, "/usage").await.is_ok());
    assert!(h.text(42, 42, "just chatting").await.is_ok());
}
