//! Test fixtures for creating test data.

use chrono::{Duration, NaiveDate};
use lead_engine::crm::{CrmStore, NewPropertyRecord, PropertyRecordUpdate};
use lead_engine::discovery::RawPermit;
use lead_engine::dispatch::OutboundMessage;
use lead_engine::workflow::{CompanyProfile, OwnerInfo, ResearchAnalysis};
use lead_engine::{
    Contact, DataQuality, MemoryCrmStore, NewStagedProperty, OutreachStatus, PropertyRecord,
    PropertySource,
};

pub const OWNER_CVR: &str = "12345678";
pub const OWNER_SITE: &str = "https://algade-ejendomme.dk";

/// A permit that passes screening: scaffolding for 120 days on a busy street.
pub fn scaffolding_permit(address: &str) -> RawPermit {
    let start = NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date");
    RawPermit {
        address: address.to_string(),
        postal_code: Some("8000".into()),
        city: Some("Aarhus".into()),
        bfe: None,
        permit_type: "stillads".into(),
        description: Some("Stillads mod facade i forbindelse med renovering".into()),
        start_date: Some(start),
        end_date: Some(start + Duration::days(120)),
        traffic_estimate: Some(15_000),
        traffic_source: Some("vejdirektoratet".into()),
    }
}

pub fn staged_candidate(address: &str) -> NewStagedProperty {
    NewStagedProperty::builder()
        .address(address)
        .source(PropertySource::Manual)
        .city("Aarhus")
        .outdoor_score(7u8)
        .build()
}

pub fn owner() -> OwnerInfo {
    OwnerInfo {
        owner_name: "Algade Ejendomme ApS".into(),
        owner_cvr: Some(OWNER_CVR.into()),
        administrator: None,
        bfe: Some("100200".into()),
    }
}

pub fn company() -> CompanyProfile {
    CompanyProfile {
        cvr: OWNER_CVR.into(),
        name: "Algade Ejendomme ApS".into(),
        address: Some("Algade 1, 8000 Aarhus C".into()),
        email: Some("info@algade-ejendomme.dk".into()),
        phone: Some("86 12 34 56".into()),
        website: Some(OWNER_SITE.into()),
    }
}

pub fn contact(email: &str, confidence: f32) -> Contact {
    Contact {
        name: "Mette Hansen".into(),
        role: Some("Ejendomschef".into()),
        email: Some(email.into()),
        phone: None,
        confidence,
    }
}

pub fn analysis_with_contact() -> ResearchAnalysis {
    ResearchAnalysis {
        owner_company: Some("Algade Ejendomme ApS".into()),
        owner_cvr: Some(OWNER_CVR.into()),
        contacts: vec![contact("mette@algade-ejendomme.dk", 0.9)],
        outdoor_score: 8,
        summary: "Hjørneejendom med stor gavl mod Algade.".into(),
        data_quality: DataQuality::High,
    }
}

pub fn owner_site_html() -> String {
    r#"<html><head><title>Algade Ejendomme</title></head>
    <body><p>Kontakt: mette@algade-ejendomme.dk, tlf. 86 12 34 56</p></body></html>"#
        .to_string()
}

/// A CRM record moved to `status` without going through the machine.
pub async fn crm_record(crm: &MemoryCrmStore, address: &str, status: OutreachStatus) -> PropertyRecord {
    let record = crm
        .create(
            NewPropertyRecord::builder()
                .name(address)
                .address(address)
                .city("Aarhus")
                .build(),
        )
        .await
        .expect("create CRM record");
    if status == record.outreach_status {
        return record;
    }
    crm.update(&record.id, PropertyRecordUpdate::status(status))
        .await
        .expect("set outreach status")
}

pub fn first_contact(recipient: &str, record: Option<&PropertyRecord>) -> OutboundMessage {
    match record {
        Some(record) => OutboundMessage::builder()
            .recipient(recipient)
            .subject("Reklameplads på jeres facade")
            .body("Hej,\n\nVi har set stilladset på jeres ejendom.")
            .property_id(record.id.clone())
            .build(),
        None => OutboundMessage::builder()
            .recipient(recipient)
            .subject("Reklameplads på jeres facade")
            .body("Hej,\n\nVi har set stilladset på jeres ejendom.")
            .build(),
    }
}
