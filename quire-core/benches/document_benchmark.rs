use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quire_core::{
    DocumentStore, ImportBatch, ImportBlock, ImportComponent, ImportPage, NewBlock, NewComponent,
    NewPage, StructuralOp, TxnOrigin,
};

fn course_batch(pages: usize) -> ImportBatch {
    let pages = (0..pages)
        .map(|i| {
            let parent = if i == 0 { None } else { Some("page-0") };
            ImportPage::new(format!("page-{i}"), parent).with_block(
                ImportBlock::new(format!("block-{i}")).with_component(
                    ImportComponent::new(format!("comp-{i}"), "text").with_html("<p>lorem ipsum</p>"),
                ),
            )
        })
        .collect();
    ImportBatch { pages, assets: Vec::new() }
}

fn bench_import_100_pages(c: &mut Criterion) {
    c.bench_function("import_100_pages", |b| {
        b.iter(|| {
            let store = DocumentStore::new("bench");
            black_box(store.import(TxnOrigin::Local, course_batch(100)).unwrap());
        })
    });
}

fn bench_structural_batch(c: &mut Criterion) {
    let store = DocumentStore::new("bench");
    store.import(TxnOrigin::Local, course_batch(50)).unwrap();
    let mut n = 0u64;

    c.bench_function("create_page_block_component", |b| {
        b.iter(|| {
            n += 1;
            let page = format!("extra-{n}");
            let block = format!("extra-block-{n}");
            black_box(
                store
                    .apply(
                        TxnOrigin::Local,
                        vec![
                            StructuralOp::CreatePage(NewPage::child_of("page-0").with_id(&page)),
                            StructuralOp::CreateBlock(NewBlock::in_page(&page).with_id(&block)),
                            StructuralOp::CreateComponent(NewComponent::in_block(&block, "text")),
                        ],
                    )
                    .unwrap(),
            );
        })
    });
}

fn bench_set_component_html(c: &mut Criterion) {
    let store = DocumentStore::new("bench");
    store.import(TxnOrigin::Local, course_batch(20)).unwrap();
    let mut n = 0u64;

    c.bench_function("set_component_html_small_edit", |b| {
        b.iter(|| {
            n += 1;
            let html = format!("<p>lorem ipsum {n}</p>");
            store
                .set_component_html(TxnOrigin::Local, "comp-10", black_box(&html))
                .unwrap();
        })
    });
}

fn bench_full_state_merge(c: &mut Criterion) {
    let source = DocumentStore::new("bench");
    source.import(TxnOrigin::Local, course_batch(100)).unwrap();
    let state = source.encode_state();

    c.bench_function("merge_full_state_100_pages", |b| {
        b.iter(|| {
            let replica = DocumentStore::new("bench");
            replica.apply_update(TxnOrigin::Remote, black_box(&state)).unwrap();
            black_box(replica.page_count());
        })
    });
}

fn bench_navigation_tree(c: &mut Criterion) {
    let store = DocumentStore::new("bench");
    store.import(TxnOrigin::Local, course_batch(200)).unwrap();

    c.bench_function("navigation_tree_200_pages", |b| {
        b.iter(|| black_box(store.navigation_tree()))
    });
}

criterion_group!(
    benches,
    bench_import_100_pages,
    bench_structural_batch,
    bench_set_component_html,
    bench_full_state_merge,
    bench_navigation_tree,
);
criterion_main!(benches);
