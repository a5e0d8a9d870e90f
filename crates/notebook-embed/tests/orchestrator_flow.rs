//! Orchestrators driven the way a host UI drives them: commands through a
//! weak handle, results observed in the store.

use std::sync::Arc;
use std::time::Duration;

use notebook_embed::testing::InMemoryLauncher;
use notebook_embed::{
    Cell, CellType, Command, ConnectionRegistry, EmbedConfig, ExecutionAdapter, FileSink,
    KernelSpec, KernelStatus, NotebookDocument, NotebookError, Orchestrator, OrchestratorState,
    OutputRecord, Store, StoreEvent,
};
use tempfile::TempDir;

struct Host {
    store: Arc<Store>,
    registry: Arc<ConnectionRegistry>,
    launcher: Arc<InMemoryLauncher>,
    _dir: TempDir,
    path: std::path::PathBuf,
}

fn host() -> Host {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notebooks").join("flow.ipynb");
    let launcher = Arc::new(InMemoryLauncher::new());
    Host {
        store: Arc::new(Store::new()),
        registry: Arc::new(ConnectionRegistry::new(
            launcher.clone(),
            EmbedConfig::default(),
        )),
        launcher,
        _dir: dir,
        path,
    }
}

fn open(host: &Host, document: NotebookDocument, kernel: Option<KernelSpec>) -> Orchestrator {
    let config = EmbedConfig {
        kernel_ready_timeout_ms: 300,
        ..EmbedConfig::default()
    };
    Orchestrator::new(
        host.store.clone(),
        host.registry.clone(),
        &config,
        document,
        Arc::new(FileSink::new(&host.path)),
        kernel,
    )
}

#[tokio::test]
async fn edit_run_save_reload() {
    let host = host();
    let orchestrator = open(&host, NotebookDocument::new(), Some(KernelSpec::new("memory")));
    orchestrator.bind().await.unwrap();
    let handle = orchestrator.handle();
    let mut events = host.store.subscribe();

    handle
        .dispatch(Command::SetSource("print(\"hello\")\n6 * 7".into()))
        .unwrap()
        .done()
        .await
        .unwrap();
    handle
        .dispatch(Command::InsertBelow(CellType::Markdown))
        .unwrap()
        .done()
        .await
        .unwrap();
    handle
        .dispatch(Command::SetSource("# Result".into()))
        .unwrap()
        .done()
        .await
        .unwrap();
    handle.dispatch(Command::RunAll).unwrap().done().await.unwrap();
    assert_eq!(orchestrator.wait_idle().await, OrchestratorState::BoundIdle);
    handle.dispatch(Command::Save).unwrap().done().await.unwrap();

    let view = handle.view().unwrap();
    assert_eq!(view.last_command, Some(Command::Save));
    assert_eq!(view.cells[0].execution_count, Some(1));
    assert_eq!(
        view.cells[0].outputs,
        vec![
            OutputRecord::stream("stdout", "hello\n"),
            OutputRecord::plain_result(Some(1), "42"),
        ]
    );
    assert!(view.cells[1].rendered);
    assert!(!view.dirty);
    assert!(view.saved_at.is_some());

    let mut saw_busy = false;
    let mut saw_saved = false;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.id(), orchestrator.id());
        match event {
            StoreEvent::StateChanged {
                state: OrchestratorState::BoundBusy,
                ..
            } => saw_busy = true,
            StoreEvent::Saved { .. } => saw_saved = true,
            _ => {}
        }
    }
    assert!(saw_busy);
    assert!(saw_saved);

    let reloaded = NotebookDocument::read_from(&host.path).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.cells()[1].cell_type, CellType::Markdown);
    assert_eq!(reloaded.cells()[1].source, "# Result");
    let texts: Vec<_> = reloaded.cells()[0]
        .outputs
        .iter()
        .map(|o| (o.output_type(), o.text_plain()))
        .collect();
    assert_eq!(
        texts,
        vec![
            ("stream", Some("hello\n".to_string())),
            ("execute_result", Some("42".to_string())),
        ]
    );

    orchestrator.dispose().await;
}

#[tokio::test]
async fn change_kernel_command_aborts_running_cell() {
    let host = host();
    let document = NotebookDocument::with_cells(vec![Cell::code("input()"), Cell::code("5")]);
    let orchestrator = open(&host, document, Some(KernelSpec::new("memory")));
    orchestrator.bind().await.unwrap();

    orchestrator.dispatch(Command::Run).unwrap().done().await.unwrap();
    let mut status = orchestrator.session().watch_status();
    status.wait_for(|s| *s == KernelStatus::Busy).await.unwrap();

    orchestrator
        .dispatch(Command::ChangeKernel(
            KernelSpec::new("memory").with_id("second"),
        ))
        .unwrap()
        .done()
        .await
        .unwrap();
    orchestrator.wait_idle().await;

    let document = orchestrator.document();
    assert_eq!(document.cells()[0].execution_count, Some(1));
    assert!(document.cells()[0].outputs.is_empty());
    assert!(host.launcher.kernel("memory").unwrap().is_dead());

    orchestrator.dispatch(Command::SetActive(1)).unwrap().done().await.unwrap();
    orchestrator.dispatch(Command::Run).unwrap().done().await.unwrap();
    orchestrator.wait_idle().await;

    let document = orchestrator.document();
    assert_eq!(document.cells()[1].execution_count, Some(1));
    assert_eq!(
        document.cells()[1].outputs,
        vec![OutputRecord::plain_result(Some(1), "5")]
    );
    let view = host.store.view(orchestrator.id()).unwrap();
    assert_eq!(view.kernel.unwrap().id, "second");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn unbound_orchestrator_binds_through_change_kernel() {
    let host = host();
    let orchestrator = open(&host, NotebookDocument::new(), None);
    assert_eq!(orchestrator.bind().await.unwrap(), OrchestratorState::Unbound);

    orchestrator
        .dispatch(Command::ChangeKernel(KernelSpec::new("memory")))
        .unwrap()
        .done()
        .await
        .unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::BoundIdle);
    orchestrator.dispose().await;
}

#[tokio::test]
async fn bind_after_change_kernel_publishes_bound_kernel() {
    let host = host();
    let orchestrator = open(&host, NotebookDocument::new(), Some(KernelSpec::new("memory")));

    orchestrator
        .dispatch(Command::ChangeKernel(
            KernelSpec::new("memory").with_id("other"),
        ))
        .unwrap()
        .done()
        .await
        .unwrap();
    assert_eq!(orchestrator.bind().await.unwrap(), OrchestratorState::BoundIdle);

    let bound = orchestrator.session().kernel().await.unwrap();
    assert_eq!(bound.id, "other");
    let view = host.store.view(orchestrator.id()).unwrap();
    assert_eq!(view.kernel, Some(bound));
    let live: Vec<_> = host.registry.list().into_iter().map(|e| e.id).collect();
    assert_eq!(live, vec!["other".to_string()]);

    orchestrator.dispose().await;
}

#[tokio::test]
async fn queued_cell_waits_out_another_submitter() {
    let host = host();
    let orchestrator = open(
        &host,
        NotebookDocument::with_cells(vec![Cell::code("3 * 3")]),
        Some(KernelSpec::new("memory")),
    );
    orchestrator.bind().await.unwrap();

    // A second adapter on the same session holds the kernel busy
    let console = ExecutionAdapter::new(orchestrator.session().clone());
    let held = console.execute("sleep(100)\n1").await.unwrap();
    assert_eq!(orchestrator.session().status(), KernelStatus::Busy);

    orchestrator.dispatch(Command::Run).unwrap().done().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_idle())
        .await
        .unwrap();

    let first = held.collect().await;
    assert_eq!(first.execution_count, Some(1));
    assert_eq!(first.result_text().as_deref(), Some("1"));
    let document = orchestrator.document();
    assert_eq!(document.cells()[0].execution_count, Some(2));
    assert_eq!(
        document.cells()[0].outputs,
        vec![OutputRecord::plain_result(Some(2), "9")]
    );
    assert!(host.store.view(orchestrator.id()).unwrap().last_error.is_none());

    orchestrator.dispose().await;
}

#[tokio::test]
async fn kernel_start_failure_is_recorded_in_store() {
    let host = host();
    host.launcher.fail_kernel("broken");
    let orchestrator = open(&host, NotebookDocument::new(), Some(KernelSpec::new("broken")));

    let err = orchestrator.bind().await.unwrap_err();
    assert!(matches!(err, NotebookError::KernelStart { .. }));

    let view = host.store.view(orchestrator.id()).unwrap();
    assert_eq!(view.state, OrchestratorState::Unbound);
    assert!(view.last_error.unwrap().contains("broken"));
    assert!(host.registry.list().is_empty());
}

#[tokio::test]
async fn disconnect_is_visible_in_store() {
    let host = host();
    let orchestrator = open(
        &host,
        NotebookDocument::with_cells(vec![Cell::code("input()")]),
        Some(KernelSpec::new("memory")),
    );
    orchestrator.bind().await.unwrap();
    let mut events = host.store.subscribe();

    orchestrator.dispatch(Command::Run).unwrap().done().await.unwrap();
    let mut status = orchestrator.session().watch_status();
    status.wait_for(|s| *s == KernelStatus::Busy).await.unwrap();
    host.launcher.kernel("memory").unwrap().simulate_disconnect();

    // The queued cell resolves rather than hanging
    tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_idle())
        .await
        .unwrap();

    // Status is mirrored by a separate task, so wait for it
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(StoreEvent::StatusChanged {
                status: KernelStatus::Disconnected,
                ..
            }) = events.recv().await
            {
                break;
            }
        }
    })
    .await
    .unwrap();
    orchestrator.dispose().await;
}

#[tokio::test]
async fn disposed_orchestrator_leaves_registry_clean() {
    let host = host();
    let first = open(&host, NotebookDocument::new(), Some(KernelSpec::new("memory")));
    let second = open(&host, NotebookDocument::new(), Some(KernelSpec::new("memory")));
    first.bind().await.unwrap();
    second.bind().await.unwrap();
    assert_eq!(host.registry.ref_count("memory"), 2);
    assert_eq!(host.launcher.starts(), 1);

    first.dispose().await;
    assert_eq!(host.registry.ref_count("memory"), 1);
    assert!(matches!(
        first.dispatch(Command::Run),
        Err(NotebookError::Disposed)
    ));

    second.dispose().await;
    assert!(host.registry.list().is_empty());
    assert_eq!(
        host.store.view(second.id()).unwrap().state,
        OrchestratorState::Disposed
    );
}
