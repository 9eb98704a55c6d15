// src/invoice_tests.rs

#[cfg(test)]
mod tests {
    use crate::aggregation::AggregatedLine;
    use crate::config::WorkdayProfile;
    use crate::invoice::*;
    use crate::reference_data::{PeriodTiming, ProjectBillingConfig};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn line<'a>(
        config: &'a ProjectBillingConfig,
        project: &str,
        task: &str,
        hours: Decimal,
        rate: Decimal,
    ) -> AggregatedLine<'a> {
        let amount = crate::aggregation::round_money(hours * rate);
        AggregatedLine {
            project_id: config.project_id.clone(),
            project_name: project.to_string(),
            customer_name: config.client.clone(),
            task: task.to_string(),
            hours,
            billable_hours: hours,
            rate,
            amount,
            billable_amount: amount,
            config: Some(config),
            entries: Vec::new(),
        }
    }

    fn acme() -> ProjectBillingConfig {
        let mut config = ProjectBillingConfig::new("p-1", "Acme Oy", "Maintenance")
            .with_invoice_ids("INV-1", "ACC-1");
        config.billable_description = "Jatkuva kehitys".into();
        config.sales_item_hours = "SI-H".into();
        config.tax_applicability = "TA".into();
        config.tax_code = "FI-25.5".into();
        config.our_reference = "Matti".into();
        config.customer_reference = "Liisa".into();
        config.contract_number = "C-9".into();
        config
    }

    // --- Invoicing month ---

    #[test]
    fn accounting_date_rolls_over_the_year() {
        let december = InvoiceMonth::new(2024, 12).unwrap();
        assert_eq!(december.accounting_date(), date("2025-01-01"));
        assert_eq!(
            december.billing_period(PeriodTiming::Post),
            (date("2024-12-01"), date("2024-12-31"))
        );
        assert_eq!(
            december.billing_period(PeriodTiming::Pre),
            (date("2025-01-01"), date("2025-01-31"))
        );
    }

    #[test]
    fn february_period_ends_on_leap_day() {
        let february = InvoiceMonth::parse("2024-02").unwrap();
        assert_eq!(february.last_day(), date("2024-02-29"));
        assert_eq!(february.sheet_label(), "02/2024");
        assert_eq!(february.to_string(), "2024-02");
    }

    #[test]
    fn previous_month_of_january_is_december() {
        let january = InvoiceMonth::containing(date("2025-01-15")).unwrap();
        let previous = january.previous().unwrap();
        assert_eq!((previous.year(), previous.month()), (2024, 12));
    }

    #[test]
    fn invalid_months_are_rejected() {
        assert!(InvoiceMonth::new(2025, 13).is_err());
        assert!(InvoiceMonth::parse("2025/03").is_err());
        assert!(InvoiceMonth::parse("march").is_err());
    }

    // --- Grouping and rows ---

    #[test]
    fn lines_sharing_a_group_share_one_invoice() {
        let first = acme().with_group_invoice("G-1");
        let second = ProjectBillingConfig::new("p-2", "Acme Oy", "Support")
            .with_group_invoice("G-1")
            .with_invoice_ids("INV-OTHER", "ACC-OTHER");
        let third = ProjectBillingConfig::new("p-3", "Beta Ab", "Ops");
        let lines = vec![
            line(&first, "Web", "Dev", dec!(2), dec!(100)),
            line(&third, "Infra", "Ops", dec!(1), dec!(80)),
            line(&second, "Support", "Helpdesk", dec!(3), dec!(50)),
        ];

        let month = InvoiceMonth::new(2025, 3).unwrap();
        let invoices = hour_invoices(&lines, &month, date("2025-04-02"));

        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[0].key, "G-1");
        assert_eq!(invoices[0].rows.len(), 2);
        // The first line's project owns the header.
        assert_eq!(invoices[0].header.invoice_a2_id, "INV-1");
        assert_eq!(invoices[1].key, "Beta Ab");
        assert_ne!(invoices[0].connect_id, invoices[1].connect_id);
    }

    #[test]
    fn zero_amount_rows_and_empty_invoices_are_dropped() {
        let acme = acme();
        let idle = ProjectBillingConfig::new("p-2", "Idle Oy", "Nothing");
        let lines = vec![
            line(&acme, "Web", "Dev", dec!(2), dec!(100)),
            line(&acme, "Web", "Meetings", dec!(1.5), Decimal::ZERO),
            line(&idle, "Idle", "Dev", dec!(4), Decimal::ZERO),
        ];
        let month = InvoiceMonth::new(2025, 3).unwrap();
        let invoices = hour_invoices(&lines, &month, date("2025-04-02"));

        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].rows.len(), 1);
        assert_eq!(invoices[0].rows[0].task, "Dev");

        let text = render_transfer(&TransferBatch::admit(invoices), &WorkdayProfile::default());
        assert_eq!(text.lines().filter(|l| l.starts_with("H;")).count(), 1);
        assert_eq!(text.lines().filter(|l| l.starts_with("R;")).count(), 1);
    }

    #[test]
    fn rendered_records_follow_the_workday_layout() {
        let acme = acme();
        let lines = vec![
            line(&acme, "Web", "Dev", dec!(7.5), dec!(95.55)),
            line(&acme, "Web", "Design", dec!(0.25), dec!(120)),
        ];
        let month = InvoiceMonth::new(2025, 3).unwrap();
        let invoices = hour_invoices(&lines, &month, date("2025-04-02"));
        let text = render_transfer(&TransferBatch::admit(invoices.clone()), &WorkdayProfile::default());
        let rows: Vec<&str> = text.lines().collect();

        assert!(text.ends_with('\n'));
        assert_eq!(
            rows[0],
            "Invoice transfer into Workday;;;Company code:;263;;;Invoicing total;;;;;;;;;;;;;"
        );
        // 7.5 * 95.55 = 716.625 -> 716.63, plus 30.00
        assert_eq!(
            rows[1],
            "Title information/Row information;;;Reply-to-email:;laskutus@barona.fi;;;746.63;;;;;;;;;;;;;"
        );
        assert!(rows[2].starts_with("Row type H= Title;ConnectID;"));
        assert!(rows[3].starts_with("Row type R= Row;ConnectID;"));

        let connect_id = invoices[0].connect_id.to_string();
        let header: Vec<&str> = rows[4].split(';').collect();
        assert_eq!(header.len(), 21);
        assert_eq!(
            header,
            vec![
                "H", connect_id.as_str(), "INV-1", "ACC-1", "", "2025-04-01", "2025-04-02",
                "Matti", "Liisa", "2025-03-01", "2025-03-31", "C-9", "", "", "", "", "", "",
                "", "Orangit", "",
            ]
        );

        let detail: Vec<&str> = rows[5].split(';').collect();
        assert_eq!(detail.len(), 21);
        assert_eq!(
            detail,
            vec![
                "R", connect_id.as_str(), "Web", "SI-H", "Web - Jatkuva kehitys - Dev", "7.50",
                "", "95.55", "1999", "IT", "10091", "KON", "", "", "", "", "", "", "TA",
                "FI-25.5", "",
            ]
        );
        assert_eq!(rows.len(), 7);
    }

    #[test]
    fn header_total_is_the_sum_of_emitted_amounts() {
        let acme = acme();
        let lines = vec![
            line(&acme, "Web", "A", dec!(0.3333), dec!(99.99)),
            line(&acme, "Web", "B", dec!(1.6667), dec!(99.99)),
            line(&acme, "Web", "C", dec!(0.01), dec!(0.5)),
        ];
        let month = InvoiceMonth::new(2025, 3).unwrap();
        let invoices = hour_invoices(&lines, &month, date("2025-04-02"));
        let totals = TransferBatch::admit(invoices.clone()).totals;
        let expected: Decimal = invoices[0].rows.iter().map(|r| r.amount).sum();
        assert_eq!(totals.amount, expected);
        assert_eq!(totals.lines, 3);
        assert_eq!(totals.invoices, 1);
        assert_eq!(totals.hours, dec!(2.0100));
    }

    #[test]
    fn invoice_overflowing_the_file_totals_is_left_out() {
        let acme = acme();
        let beta = ProjectBillingConfig::new("p-2", "Beta Ab", "Ops");
        let lines = vec![
            line(&acme, "Web", "Dev", Decimal::MAX, Decimal::ONE),
            line(&beta, "Infra", "Ops", Decimal::MAX, Decimal::ONE),
        ];
        let month = InvoiceMonth::new(2025, 3).unwrap();
        let batch = TransferBatch::admit(hour_invoices(&lines, &month, date("2025-04-02")));

        assert_eq!(batch.invoices.len(), 1);
        assert_eq!(batch.invoices[0].key, "INV-1");
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].key, "Beta Ab");
        assert_eq!(batch.totals.amount, Decimal::MAX);
        assert_eq!(batch.totals.invoices, 1);
        assert_eq!(batch.totals.lines, 1);

        let text = render_transfer(&batch, &WorkdayProfile::default());
        assert_eq!(text.lines().filter(|l| l.starts_with("H;")).count(), 1);
    }

    #[test]
    fn pre_period_projects_bill_the_following_month() {
        let mut config = acme();
        config.period = "pre".into();
        let month = InvoiceMonth::new(2025, 3).unwrap();
        let header = InvoiceHeader::from_config(&config, &month, date("2025-04-02"));
        assert_eq!(header.period_start, date("2025-04-01"));
        assert_eq!(header.period_end, date("2025-04-30"));
        assert_eq!(header.accounting_date, date("2025-04-01"));
    }

    // --- Encoding and writing ---

    #[test]
    fn windows_1252_encoding_replaces_unmappable_characters() {
        let bytes = encode_windows_1252("Käyttö 5€ Ω;");
        assert_eq!(
            bytes,
            vec![b'K', 0xE4, b'y', b't', b't', 0xF6, b' ', b'5', 0x80, b' ', b'?', b';']
        );
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("result.csv");
        write_atomic(&path, b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn failed_rename_cleans_up_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.csv");
        // A non-empty directory in the way makes the rename fail.
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        assert!(write_atomic(&path, b"payload").is_err());
        assert!(!temp_sibling(&path).exists());
        assert!(path.is_dir());
    }

    #[test]
    fn sibling_paths_share_the_result_stem() {
        let path = std::path::Path::new("/out/invoices_2025_03.csv");
        assert_eq!(
            sibling_with_suffix(path, "_summary", "txt"),
            std::path::PathBuf::from("/out/invoices_2025_03_summary.txt")
        );
    }
}
