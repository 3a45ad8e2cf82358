use chart_engine::{
    AnnotationKind, ChartConfig, ChartSession, CommandOutcome, PanelId, PointerOutcome, KEY_D,
    KEY_DELETE, KEY_ESCAPE,
};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use data_feed::JsonSource;

fn weekday_rows(n: usize) -> String {
    let mut day = NaiveDate::from_ymd_opt(2020, 3, 2).unwrap();
    let mut rows = Vec::new();
    while rows.len() < n {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            let i = rows.len() as f64;
            let close = 50.0 + (i * 0.7).sin() * 5.0 + i * 0.1;
            rows.push(format!(
                r#"{{"date": "{}", "open": {}, "high": {}, "low": {}, "close": {}, "volume": {}}}"#,
                day.format("%Y-%m-%d"),
                close - 0.5,
                close + 1.5,
                close - 1.5,
                close,
                10_000 + rows.len() * 25
            ));
        }
        day += Duration::days(1);
    }
    format!("[{}]", rows.join(","))
}

const CONFIG: &str = r#"{
    "width": 660,
    "visible_bars": 30,
    "indicators": [
        {"key": "ema10", "kind": "ema", "window": 10, "source": "close"},
        {"key": "smaVol", "kind": "sma", "window": 5, "source": "volume"},
        {"key": "emaOfEma", "kind": "ema", "window": 3, "of": "ema10"}
    ],
    "panels": [
        {"id": 1, "top": 0, "height": 460, "padding_top": 10, "padding_bottom": 10,
         "extents": ["high", "low", {"indicator": "ema10"}]},
        {"id": 2, "top": 460, "height": 100, "drawable": false,
         "extents": ["volume", {"indicator": "smaVol"}]}
    ]
}"#;

const MARKS: &str = r#"{
    "R1": 62.5, "S1": 41.0,
    "marks": [
        {"date": "03/04/2020", "direction": "under", "color": "green"},
        {"date": "03/07/2020", "direction": "over", "color": "red"},
        {"date": "13/45/2020", "direction": "over", "color": "red"}
    ]
}"#;

#[test]
fn full_session_flow() {
    let config = ChartConfig::from_json_str(CONFIG).unwrap();
    let source = JsonSource::new(weekday_rows(60), MARKS);
    let (mut session, report) = ChartSession::from_source(&source, config).unwrap();

    // indicators layered in order
    let last = session.records().last().unwrap();
    assert!(last.get("ema10").is_some());
    assert!(last.get("emaOfEma").is_some());
    assert_eq!(session.records()[3].get("smaVol"), None);
    assert!(session.records()[4].get("smaVol").is_some());

    // 03/07/2020 is a Saturday: no record on that day
    assert_eq!(report.levels.len(), 2);
    assert_eq!(report.placed.len(), 1);
    assert_eq!(report.not_placed, vec!["03/07/2020", "13/45/2020"]);
    let levels: Vec<_> = session
        .annotations()
        .annotations(PanelId::PRICE)
        .iter()
        .filter(|a| a.kind == AnnotationKind::PriceLevel)
        .map(|a| (a.text.clone(), a.anchor.price()))
        .collect();
    assert_eq!(
        levels,
        vec![("R1".to_string(), 62.5), ("S1".to_string(), 41.0)]
    );

    // window shows the last 30 bars across the 520px plot
    assert_eq!(session.visible().len(), 30);
    assert_eq!(session.scales().time.band_width(), 520.0 / 30.0);

    // pointer placement round-trips within a pixel
    let ordinal = 45;
    let x = session.scales().time.x_of(ordinal) + 3.0;
    let y = 123.0;
    let PointerOutcome::Placed(id) = session.handle_pointer_down(PanelId::PRICE, x, y).unwrap()
    else {
        panic!("price panel accepts placement");
    };
    session.commit_text("entry").unwrap();
    let note = session.annotations().get(id).unwrap().clone();
    let scales = session.scales();
    let price = scales.price(PanelId::PRICE).unwrap();
    assert!((note.y(price) - y).abs() <= 1.0);
    assert_eq!(note.x(&scales.time), Some(scales.time.x_of(ordinal)));
    assert_eq!(note.text, "entry");

    // volume panel refuses placement
    assert_eq!(session.handle_key_command(KEY_D), CommandOutcome::DrawModeChanged(true));
    assert_eq!(
        session.handle_pointer_down(PanelId::VOLUME, x, 500.0).unwrap(),
        PointerOutcome::Ignored
    );

    // select the note and delete it with the keyboard
    assert_eq!(
        session.handle_key_command(KEY_ESCAPE),
        CommandOutcome::DrawModeChanged(false)
    );
    assert_eq!(session.handle_selection(PanelId::PRICE, &[id]), Some(1));
    let before = session.annotations().len();
    assert_eq!(session.handle_key_command(KEY_DELETE), CommandOutcome::Deleted(1));
    assert_eq!(session.annotations().len(), before - 1);
    assert!(session.annotations().get(id).is_none());

    // panning back keeps annotations anchored to their dates
    let mark_id = report.placed[0];
    session.pan(-30).unwrap();
    assert_eq!(session.visible().start(), 0);
    let mark = session.annotations().get(mark_id).unwrap();
    let mark_x = mark.x(&session.scales().time).unwrap();
    assert_eq!(mark_x, session.scales().time.x_of(2));
}
