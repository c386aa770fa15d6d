#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::NaiveDate;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::mail_reader::attachment_store::{AttachmentStore, RetryPolicy, StoreMode};
    use crate::mail_reader::cursor::CursorStore;
    use crate::mail_reader::error::{Result, SyncError};
    use crate::mail_reader::fetch::{days_ago, MailboxSession, SelectionCriterion};
    use crate::mail_reader::imap::{AccessMode, Connector, Credentials};
    use crate::mail_reader::message::RawMessage;
    use crate::mail_reader::{sync, SyncMode, SyncReport, SyncRequest};
    use crate::settings::Config;
    use crate::web_services::{create_router, AppState};

    const PASSWORD: &str = "secret";

    #[derive(Debug, Default)]
    struct Journal {
        opened: usize,
        closed: usize,
        fetched: Vec<u32>,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeMailbox {
        messages: Vec<(u32, NaiveDate, Vec<u8>)>,
        broken_uid: Option<u32>,
        journal: Arc<Mutex<Journal>>,
    }

    struct FakeSession {
        mailbox: FakeMailbox,
    }

    impl FakeMailbox {
        fn with(mut self, uid: u32, received: NaiveDate, bytes: Vec<u8>) -> Self {
            self.messages.push((uid, received, bytes));
            self
        }

        fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
            self.journal.lock().unwrap()
        }
    }

    impl Connector for FakeMailbox {
        type Session = FakeSession;

        async fn open(&self, credentials: &Credentials, folder: &str, _mode: AccessMode) -> Result<FakeSession> {
            if credentials.secret != PASSWORD {
                return Err(SyncError::Authentication(credentials.address.clone()));
            }
            if folder != "INBOX" {
                return Err(SyncError::FolderNotFound(folder.to_string()));
            }
            self.journal().opened += 1;
            Ok(FakeSession { mailbox: self.clone() })
        }
    }

    impl MailboxSession for FakeSession {
        async fn search(&mut self, criterion: &SelectionCriterion) -> Result<Vec<u32>> {
            Ok(self
                .mailbox
                .messages
                .iter()
                .filter(|(uid, received, _)| criterion.admits(*uid, *received))
                .map(|(uid, _, _)| *uid)
                .collect())
        }

        async fn fetch_raw(&mut self, uid: u32) -> Result<RawMessage> {
            if self.mailbox.broken_uid == Some(uid) {
                return Err(SyncError::Protocol(format!("no body returned for UID {}", uid)));
            }
            self.mailbox.journal().fetched.push(uid);
            let (_, _, bytes) = self
                .mailbox
                .messages
                .iter()
                .find(|(candidate, _, _)| *candidate == uid)
                .ok_or_else(|| SyncError::Protocol(format!("unknown UID {}", uid)))?;
            Ok(RawMessage {
                uid,
                bytes: bytes.clone(),
            })
        }

        async fn close(&mut self) {
            self.mailbox.journal().closed += 1;
        }
    }

    struct Fixture {
        dir: TempDir,
        store: AttachmentStore,
        cursors: CursorStore,
    }

    impl Fixture {
        fn new(mode: StoreMode, retry_policy: RetryPolicy) -> Self {
            let dir = TempDir::new().unwrap();
            let store = AttachmentStore::new(dir.path().join("attachments"), mode, retry_policy).unwrap();
            let cursors = CursorStore::new(dir.path().join("cursor.json"));
            Fixture {
                dir,
                store,
                cursors,
            }
        }

        fn stored_files(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.store.root())
                .unwrap()
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .collect();
            names.sort();
            names
        }

        async fn run(&self, mailbox: &FakeMailbox, mode: SyncMode) -> Result<SyncReport> {
            sync(mailbox, &self.store, &self.cursors, &request(mode, PASSWORD)).await
        }
    }

    fn request(mode: SyncMode, password: &str) -> SyncRequest {
        SyncRequest {
            credentials: Credentials {
                address: "user@example.com".to_string(),
                secret: password.to_string(),
            },
            folder: "INBOX".to_string(),
            mode,
            access: AccessMode::ReadOnly,
            include_payload: true,
        }
    }

    fn plain(subject: &str) -> Vec<u8> {
        format!(
            "From: sender@example.com\r\nSubject: {}\r\nContent-Type: text/plain\r\n\r\nbody of {}",
            subject, subject
        )
        .into_bytes()
    }

    fn with_attachment(subject: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        format!(
            "From: sender@example.com\r\n\
             Subject: {subject}\r\n\
             Content-Type: multipart/mixed; boundary=XX\r\n\
             \r\n\
             --XX\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             see attached\r\n\
             --XX\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename=\"{filename}\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {payload}\r\n\
             --XX--\r\n",
            payload = BASE64.encode(content),
        )
        .into_bytes()
    }

    fn today() -> NaiveDate {
        days_ago(0).unwrap()
    }

    async fn preset_cursor(cursors: &CursorStore, uid: u32) {
        cursors.lock_folder("INBOX").await.advance(uid).await.unwrap();
    }

    #[tokio::test]
    async fn incremental_run_processes_only_new_uids() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        preset_cursor(&fixture.cursors, 42).await;
        let mailbox = FakeMailbox::default()
            .with(40, today(), plain("forty"))
            .with(41, today(), plain("forty-one"))
            .with(43, today(), plain("forty-three"))
            .with(44, today(), plain("forty-four"));

        let report = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();

        let uids: Vec<u32> = report.emails.iter().map(|m| m.uid).collect();
        assert_eq!(vec![43, 44], uids);
        assert_eq!(2, report.count);
        assert_eq!(Some(44), report.cursor);
        assert_eq!(44, fixture.cursors.peek("INBOX").await.unwrap());
        assert_eq!(vec![43, 44], mailbox.journal().fetched);
        assert_eq!(1, mailbox.journal().closed);
    }

    #[tokio::test]
    async fn cursor_never_decreases_across_runs() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default()
            .with(5, today(), plain("five"))
            .with(9, today(), plain("nine"));

        let first = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();
        assert_eq!(Some(9), first.cursor);

        let second = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();
        assert_eq!(0, second.count);
        assert_eq!(Some(9), second.cursor);
        assert_eq!(9, fixture.cursors.peek("INBOX").await.unwrap());
    }

    #[tokio::test]
    async fn window_run_returns_recent_messages() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default()
            .with(1, days_ago(100).unwrap(), plain("old"))
            .with(2, days_ago(89).unwrap(), plain("recent"))
            .with(3, days_ago(1).unwrap(), plain("yesterday"));

        let report = fixture
            .run(&mailbox, SyncMode::Window { since: days_ago(90).unwrap() })
            .await
            .unwrap();

        let subjects: Vec<&str> = report.emails.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(vec!["recent", "yesterday"], subjects);
        assert_eq!(None, report.cursor);
        // Window runs never touch the cursor.
        assert_eq!(0, fixture.cursors.peek("INBOX").await.unwrap());
    }

    #[tokio::test]
    async fn plain_message_has_no_attachments() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default().with(1, today(), plain("hello"));

        let report = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();

        let message = &report.emails[0];
        assert_eq!("body of hello", message.body);
        assert!(message.attachments.is_empty());
        assert!(fixture.stored_files().is_empty());
    }

    #[tokio::test]
    async fn attachments_are_stored_and_echoed_back() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let content: Vec<u8> = (0..=255u8).collect();
        let mailbox = FakeMailbox::default().with(43, today(), with_attachment("report", "report (final)!.pdf", &content));

        let report = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();

        let attachment = &report.emails[0].attachments[0];
        assert_eq!("reportfinal.pdf", attachment.filename);
        assert_eq!("application/octet-stream", attachment.content_type);
        assert!(attachment.stored_reference.as_str().ends_with("_43_0_reportfinal.pdf"));
        assert_eq!(
            content,
            BASE64.decode(attachment.payload.as_ref().unwrap()).unwrap()
        );
        assert_eq!(content, fs::read(fixture.store.path_of(&attachment.stored_reference)).unwrap());
        assert_eq!(vec![attachment.stored_reference.to_string()], fixture.stored_files());
    }

    #[tokio::test]
    async fn same_named_attachments_keep_their_own_bytes() {
        let message: Vec<u8> = "From: sender@example.com\r\n\
             Subject: scans\r\n\
             Content-Type: multipart/mixed; boundary=XX\r\n\
             \r\n\
             --XX\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"scan.pdf\"\r\n\
             \r\n\
             first\r\n\
             --XX\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"scan.pdf\"\r\n\
             \r\n\
             second\r\n\
             --XX--\r\n"
            .into();

        for policy in [RetryPolicy::AtLeastOnce, RetryPolicy::BestEffortOnce] {
            let fixture = Fixture::new(StoreMode::Unique, policy);
            let mailbox = FakeMailbox::default().with(7, today(), message.clone());

            let report = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();

            let attachments = &report.emails[0].attachments;
            assert_eq!(2, attachments.len());
            assert_ne!(attachments[0].stored_reference, attachments[1].stored_reference);
            let payloads: Vec<Vec<u8>> = attachments
                .iter()
                .map(|a| BASE64.decode(a.payload.as_ref().unwrap()).unwrap())
                .collect();
            assert_eq!(vec![b"first".to_vec(), b"second".to_vec()], payloads);
            assert_eq!(2, fixture.stored_files().len());
        }
    }

    #[tokio::test]
    async fn failed_batch_leaves_cursor_and_closes_session() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        preset_cursor(&fixture.cursors, 42).await;
        let mut mailbox = FakeMailbox::default()
            .with(43, today(), with_attachment("a", "a.bin", b"first"))
            .with(44, today(), plain("b"));
        mailbox.broken_uid = Some(44);

        let err = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap_err();

        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(42, fixture.cursors.peek("INBOX").await.unwrap());
        assert_eq!(1, mailbox.journal().closed);

        // The retry starts from the same place and stores 43's attachment again.
        mailbox.broken_uid = None;
        let report = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();
        assert_eq!(2, report.count);
        assert_eq!(44, fixture.cursors.peek("INBOX").await.unwrap());
        assert_eq!(vec![43, 43, 44], mailbox.journal().fetched);
        assert_eq!(2, mailbox.journal().closed);
    }

    #[tokio::test]
    async fn best_effort_once_avoids_duplicates_on_retry() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::BestEffortOnce);
        let mut mailbox = FakeMailbox::default()
            .with(1, today(), with_attachment("a", "a.bin", b"payload"))
            .with(2, today(), plain("b"));
        mailbox.broken_uid = Some(2);

        assert!(fixture.run(&mailbox, SyncMode::Incremental).await.is_err());
        assert_eq!(1, fixture.stored_files().len());

        mailbox.broken_uid = None;
        fixture.run(&mailbox, SyncMode::Incremental).await.unwrap();
        assert_eq!(1, fixture.stored_files().len());
    }

    #[tokio::test]
    async fn undecodable_message_aborts_the_batch() {
        let fixture = Fixture::new(StoreMode::Overwrite, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default()
            .with(1, today(), with_attachment("a", "a.bin", b"x"))
            .with(2, today(), b"Subject: =?x-unknown?Q?hi?=\r\n\r\nbody".to_vec());

        let err = fixture.run(&mailbox, SyncMode::Incremental).await.unwrap_err();

        assert!(matches!(err, SyncError::Decoding(_)));
        assert_eq!(0, fixture.cursors.peek("INBOX").await.unwrap());
        assert_eq!(1, mailbox.journal().closed);
    }

    #[tokio::test]
    async fn authentication_failure_writes_nothing() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default().with(1, today(), with_attachment("a", "a.bin", b"x"));

        let err = sync(
            &mailbox,
            &fixture.store,
            &fixture.cursors,
            &request(SyncMode::Incremental, "wrong"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(fixture.stored_files().is_empty());
        assert_eq!(0, fixture.cursors.peek("INBOX").await.unwrap());
        assert!(!fixture.dir.path().join("cursor.json").exists());
        assert_eq!(0, mailbox.journal().opened);
    }

    #[tokio::test]
    async fn missing_folder_is_reported() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mut req = request(SyncMode::Incremental, PASSWORD);
        req.folder = "Nowhere".to_string();

        let err = sync(&FakeMailbox::default(), &fixture.store, &fixture.cursors, &req)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_incremental_runs_do_not_double_process() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default()
            .with(1, today(), plain("one"))
            .with(2, today(), plain("two"));

        let (a, b) = tokio::join!(
            fixture.run(&mailbox, SyncMode::Incremental),
            fixture.run(&mailbox, SyncMode::Incremental)
        );

        let mut counts = vec![a.unwrap().count, b.unwrap().count];
        counts.sort();
        assert_eq!(vec![0, 2], counts);
        assert_eq!(vec![1, 2], mailbox.journal().fetched);
        assert_eq!(2, fixture.cursors.peek("INBOX").await.unwrap());
    }

    // The temp dir has to outlive the router.
    fn app(fixture: Fixture, mailbox: FakeMailbox) -> (TempDir, axum::Router) {
        let router = create_router(AppState {
            config: Arc::new(Config::default()),
            connector: Arc::new(mailbox),
            store: Arc::new(fixture.store),
            cursors: Arc::new(fixture.cursors),
        });
        (fixture.dir, router)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/get_emails")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn http_get_emails_returns_report() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let mailbox = FakeMailbox::default().with(7, today(), with_attachment("hi", "x.txt", b"abc"));

        let (_dir, router) = app(fixture, mailbox);
        let response = router
            .oneshot(post_json(serde_json::json!({
                "email": "user@example.com",
                "password": PASSWORD,
            })))
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, response.status());
        let json = body_json(response).await;
        assert_eq!(1, json["count"]);
        assert_eq!("hi", json["emails"][0]["subject"]);
        assert_eq!("x.txt", json["emails"][0]["attachments"][0]["filename"]);
        assert_eq!(BASE64.encode(b"abc"), json["emails"][0]["attachments"][0]["data"]);
    }

    #[tokio::test]
    async fn http_requires_credentials() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let (_dir, router) = app(fixture, FakeMailbox::default());
        let response = router
            .oneshot(post_json(serde_json::json!({ "email": "user@example.com" })))
            .await
            .unwrap();

        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        assert_eq!("Email and password are required", body_json(response).await["error"]);
    }

    #[tokio::test]
    async fn http_rejects_unusable_since_days() {
        for days in [-1i64, 200_000_000] {
            let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
            let (_dir, router) = app(fixture, FakeMailbox::default());
            let response = router
                .oneshot(post_json(serde_json::json!({
                    "email": "user@example.com",
                    "password": PASSWORD,
                    "since_days": days,
                })))
                .await
                .unwrap();

            assert_eq!(StatusCode::BAD_REQUEST, response.status(), "since_days {}", days);
            assert!(body_json(response).await["error"].as_str().unwrap().contains("since_days"));
        }
    }

    #[tokio::test]
    async fn http_reports_bad_login() {
        let fixture = Fixture::new(StoreMode::Unique, RetryPolicy::AtLeastOnce);
        let (_dir, router) = app(fixture, FakeMailbox::default());
        let response = router
            .oneshot(post_json(serde_json::json!({
                "email": "user@example.com",
                "password": "wrong",
                "mode": "incremental",
            })))
            .await
            .unwrap();

        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
        assert!(body_json(response).await["error"].as_str().unwrap().contains("Authentication"));
    }

    #[tokio::test]
    async fn http_serves_stored_attachment() {
        let fixture = Fixture::new(StoreMode::Overwrite, RetryPolicy::AtLeastOnce);
        fixture.store.persist(1, 0, "scan.pdf", b"%PDF-1.4").unwrap();
        let (_dir, router) = app(fixture, FakeMailbox::default());

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/attachments/scan.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("application/pdf", response.headers()[header::CONTENT_TYPE]);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(b"%PDF-1.4".as_slice(), bytes.as_ref());

        let missing = router
            .oneshot(Request::builder().uri("/attachments/other.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, missing.status());
    }
}
